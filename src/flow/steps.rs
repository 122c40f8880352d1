//! Projection of a validated flow into ordered test steps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::graph::{self, LinearOrder, ValidationError};
use super::types::{FlowConfig, FlowNode, NodeKind};
use super::variables::{collect_references, validate_references, StepReference};

/// One executable step of a test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    pub node_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_id: Option<String>,
    /// Position in the execution order, starting at 0.
    pub order: u32,
    pub is_cleanup: bool,
    /// The node as authored, without editor-only fields.
    pub config: Value,
}

/// A flow that passed every check, with its derived steps.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedFlow {
    pub order: LinearOrder,
    pub references: Vec<StepReference>,
    pub steps: Vec<TestStep>,
}

impl ValidatedFlow {
    pub fn orphans(&self) -> &[String] {
        &self.order.orphans
    }
}

/// Validate a flow and derive its ordered steps.
///
/// Start and end nodes do not become steps. Step order indices are dense.
pub fn validate_flow(flow: &FlowConfig) -> Result<ValidatedFlow, ValidationError> {
    let order = graph::validate(&flow.nodes, &flow.edges)?;
    let references = collect_references(&flow.nodes);
    validate_references(&order, &references)?;

    let mut steps = Vec::new();
    for id in &order.nodes {
        let Some(node) = flow.nodes.iter().find(|n| n.id() == id) else {
            continue;
        };
        if !node.is_step() {
            continue;
        }
        steps.push(project(node, steps.len() as u32));
    }

    Ok(ValidatedFlow {
        order,
        references,
        steps,
    })
}

fn project(node: &FlowNode, order: u32) -> TestStep {
    let (api_id, is_cleanup) = match node {
        FlowNode::Api { data, .. } => (Some(data.api_id.clone()), data.is_cleanup),
        FlowNode::Parallel { data, .. } => (None, data.is_cleanup),
        _ => (None, false),
    };
    TestStep {
        node_id: node.id().to_string(),
        name: node.name().to_string(),
        step_type: node.kind(),
        api_id,
        order,
        is_cleanup,
        config: serde_json::to_value(node).unwrap_or(Value::Null),
    }
}
