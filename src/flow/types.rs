//! Flow document types.
//!
//! A flow is the authored graph of one test case. Documents use camelCase
//! keys so they can be exchanged with the flow editor as-is.
//!
//! # Example
//!
//! ```json
//! {
//!   "nodes": [
//!     { "type": "start", "id": "start" },
//!     { "type": "api", "id": "step_login", "data": {
//!         "apiId": "api-login", "method": "POST", "url": "/login" } },
//!     { "type": "end", "id": "end" }
//!   ],
//!   "edges": [
//!     { "source": "start", "target": "step_login" },
//!     { "source": "step_login", "target": "end" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A complete flow: nodes, edges and optional flow-level variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    pub nodes: Vec<FlowNode>,

    #[serde(default)]
    pub edges: Vec<FlowEdge>,

    /// Flow-level variables available to every node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
}

/// A node of the flow graph, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowNode {
    Start {
        id: String,
    },
    Api {
        id: String,
        data: ApiNodeData,
    },
    Wait {
        id: String,
        data: WaitConfig,
    },
    Assertion {
        id: String,
        data: AssertionNodeData,
    },
    Parallel {
        id: String,
        data: ParallelNodeData,
    },
    End {
        id: String,
    },
}

impl FlowNode {
    pub fn id(&self) -> &str {
        match self {
            FlowNode::Start { id }
            | FlowNode::Api { id, .. }
            | FlowNode::Wait { id, .. }
            | FlowNode::Assertion { id, .. }
            | FlowNode::Parallel { id, .. }
            | FlowNode::End { id } => id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            FlowNode::Start { .. } => NodeKind::Start,
            FlowNode::Api { .. } => NodeKind::Api,
            FlowNode::Wait { .. } => NodeKind::Wait,
            FlowNode::Assertion { .. } => NodeKind::Assertion,
            FlowNode::Parallel { .. } => NodeKind::Parallel,
            FlowNode::End { .. } => NodeKind::End,
        }
    }

    /// Display name, falling back to the node id.
    pub fn name(&self) -> &str {
        let named = match self {
            FlowNode::Api { data, .. } => data.name.as_deref(),
            FlowNode::Parallel { data, .. } => Some(data.name.as_str()),
            FlowNode::Assertion { data, .. } => data.name.as_deref(),
            _ => None,
        };
        named.filter(|n| !n.is_empty()).unwrap_or_else(|| self.id())
    }

    /// Whether this node becomes a persisted test step.
    pub fn is_step(&self) -> bool {
        !matches!(self, FlowNode::Start { .. } | FlowNode::End { .. })
    }
}

/// Node kind without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    Api,
    Wait,
    Assertion,
    Parallel,
    End,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Api => write!(f, "api"),
            Self::Wait => write!(f, "wait"),
            Self::Assertion => write!(f, "assertion"),
            Self::Parallel => write!(f, "parallel"),
            Self::End => write!(f, "end"),
        }
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
}

impl FlowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Value of a single request parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "valueType", rename_all = "camelCase")]
pub enum ParamValue {
    /// Literal value sent as-is.
    Fixed {
        #[serde(default)]
        value: Value,
    },
    /// Value resolved at run time, e.g. `step_1.response.data.token`.
    Variable {
        variable: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template: Option<String>,
    },
}

/// A request body field: either a parameter value or a nested object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BodyField {
    Param(ParamValue),
    Nested(BTreeMap<String, BodyField>),
}

/// Request parameters of an api call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub path_params: BTreeMap<String, ParamValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, ParamValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, ParamValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub body: BTreeMap<String, BodyField>,
}

/// Response value captured into a named variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseExtract {
    pub path: String,
    pub variable: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssertionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpectedType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Auto,
}

/// Assertion evaluated by the worker against a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub field: String,
    pub operator: AssertionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default)]
    pub expected_type: ExpectedType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssertionFailureStrategy {
    #[default]
    StopOnFailure,
    ContinueAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitType {
    Time,
    Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitOperator {
    Equals,
    NotEquals,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitCondition {
    pub variable: String,
    pub operator: WaitOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
}

/// Wait policy: a fixed delay or polling until a condition holds.
///
/// Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitConfig {
    #[serde(rename = "type")]
    pub wait_type: WaitType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    #[serde(default = "default_wait_timeout")]
    pub timeout: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<WaitCondition>,
}

fn default_wait_timeout() -> u64 {
    30_000
}

fn default_check_interval() -> u64 {
    2_000
}

/// Explicit cross-step reference declared on an api node.
///
/// The value at `param_path` (e.g. `pathParams.userId`) is read from the
/// response recorded for `source_node` at `source_path` (e.g. `data.token`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableReference {
    pub param_path: String,
    pub source_node: String,
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Configuration of an api node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiNodeData {
    pub api_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub request_config: RequestConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_extract: Vec<ResponseExtract>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub assertion_failure_strategy: AssertionFailureStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitConfig>,
    #[serde(default)]
    pub is_cleanup: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variable_refs: Vec<VariableReference>,
}

/// One api call inside a parallel node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelApiConfig {
    pub id: String,
    #[serde(flatten)]
    pub api: ApiNodeData,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParallelFailureStrategy {
    #[default]
    StopAll,
    ContinueAll,
}

/// Configuration of a parallel node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelNodeData {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub apis: Vec<ParallelApiConfig>,
    #[serde(default)]
    pub failure_strategy: ParallelFailureStrategy,
    #[serde(default)]
    pub is_cleanup: bool,
}

/// Configuration of a standalone assertion node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}
