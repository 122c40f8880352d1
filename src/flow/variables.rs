//! Cross-step variable references.
//!
//! A step can read a value from the response recorded for an earlier step,
//! written as `<node>.response.<path>` in a variable parameter or declared
//! explicitly in `variableRefs`. This module collects those references and
//! checks them against the linear order. Resolution itself happens in the
//! worker; `resolve_path` and `apply_template` define the contract it follows.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::graph::{LinearOrder, ValidationError};
use super::types::{ApiNodeData, BodyField, FlowNode, ParamValue};

/// Placeholder substituted by `apply_template`.
pub const TEMPLATE_PLACEHOLDER: &str = "{value}";

/// A dependency of one node's parameter on another node's response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReference {
    /// Node holding the parameter.
    pub node: String,
    pub param_path: String,
    pub source_node: String,
    pub source_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Split `<node>.response[.<path>]` into node id and response path.
///
/// Anything else (flow variables, runtime functions) is not a step reference.
pub fn parse_step_variable(expr: &str) -> Option<(&str, &str)> {
    let expr = expr.trim();
    let (node, rest) = expr.split_once('.')?;
    if node.is_empty() {
        return None;
    }
    match rest.strip_prefix("response") {
        Some("") => Some((node, "")),
        Some(path) => path.strip_prefix('.').map(|p| (node, p)),
        None => None,
    }
}

/// Collect every step reference declared by the flow's nodes.
pub fn collect_references(nodes: &[FlowNode]) -> Vec<StepReference> {
    let mut refs = Vec::new();
    for node in nodes {
        match node {
            FlowNode::Api { id, data } => collect_from_api(id, "", data, &mut refs),
            FlowNode::Parallel { id, data } => {
                for api in &data.apis {
                    let prefix = format!("apis.{}.", api.id);
                    collect_from_api(id, &prefix, &api.api, &mut refs);
                }
            }
            FlowNode::Wait { id, data } => {
                if let Some(condition) = &data.condition {
                    push_variable(id, "condition.variable", &condition.variable, None, &mut refs);
                }
            }
            _ => {}
        }
    }
    refs
}

fn collect_from_api(node: &str, prefix: &str, api: &ApiNodeData, refs: &mut Vec<StepReference>) {
    let request = &api.request_config;
    let sections: [(&str, &BTreeMap<String, ParamValue>); 3] = [
        ("pathParams", &request.path_params),
        ("queryParams", &request.query_params),
        ("headers", &request.headers),
    ];
    for (section, params) in sections {
        for (key, value) in params {
            let path = format!("{}{}.{}", prefix, section, key);
            collect_from_param(node, &path, value, refs);
        }
    }
    collect_from_body(node, &format!("{}body", prefix), &request.body, refs);

    for explicit in &api.variable_refs {
        refs.push(StepReference {
            node: node.to_string(),
            param_path: format!("{}{}", prefix, explicit.param_path),
            source_node: explicit.source_node.clone(),
            source_path: explicit.source_path.clone(),
            template: explicit.template.clone(),
        });
    }
}

fn collect_from_body(
    node: &str,
    path: &str,
    body: &BTreeMap<String, BodyField>,
    refs: &mut Vec<StepReference>,
) {
    for (key, field) in body {
        let field_path = format!("{}.{}", path, key);
        match field {
            BodyField::Param(value) => collect_from_param(node, &field_path, value, refs),
            BodyField::Nested(inner) => collect_from_body(node, &field_path, inner, refs),
        }
    }
}

fn collect_from_param(node: &str, path: &str, value: &ParamValue, refs: &mut Vec<StepReference>) {
    if let ParamValue::Variable { variable, template } = value {
        push_variable(node, path, variable, template.as_deref(), refs);
    }
}

fn push_variable(
    node: &str,
    path: &str,
    variable: &str,
    template: Option<&str>,
    refs: &mut Vec<StepReference>,
) {
    if let Some((source, source_path)) = parse_step_variable(variable) {
        refs.push(StepReference {
            node: node.to_string(),
            param_path: path.to_string(),
            source_node: source.to_string(),
            source_path: source_path.to_string(),
            template: template.map(str::to_string),
        });
    }
}

/// Check that every reference reads from a node placed strictly earlier.
///
/// Self references count as forward references.
pub fn validate_references(
    order: &LinearOrder,
    references: &[StepReference],
) -> Result<(), ValidationError> {
    let position: BTreeMap<&str, usize> = order
        .nodes
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    for reference in references {
        let Some(&source_pos) = position.get(reference.source_node.as_str()) else {
            return Err(ValidationError::UnknownReferenceSource {
                node: reference.node.clone(),
                source_node: reference.source_node.clone(),
            });
        };
        let node_pos = position
            .get(reference.node.as_str())
            .copied()
            .unwrap_or(usize::MAX);
        if source_pos >= node_pos {
            return Err(ValidationError::ForwardReference {
                node: reference.node.clone(),
                source_node: reference.source_node.clone(),
            });
        }

        if let Some(template) = &reference.template {
            let count = template.matches(TEMPLATE_PLACEHOLDER).count();
            if count > 1 {
                return Err(ValidationError::TemplatePlaceholders {
                    node: reference.node.clone(),
                    param_path: reference.param_path.clone(),
                    count,
                });
            }
        }
    }
    Ok(())
}

/// Walk a dot-separated path; numeric segments index arrays.
pub fn resolve_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Substitute a resolved value into a template's `{value}` placeholder.
///
/// Without a template the value passes through unchanged.
pub fn apply_template(template: Option<&str>, value: &Value) -> Value {
    match template {
        None => value.clone(),
        Some(template) => {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            Value::String(template.replacen(TEMPLATE_PLACEHOLDER, &rendered, 1))
        }
    }
}
