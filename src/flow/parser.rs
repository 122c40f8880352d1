//! Flow document parser.
//!
//! Accepts JSON or YAML. JSON is a subset of YAML, so the YAML parser is used
//! for anything that does not look like a JSON object.

use std::path::Path;

use super::types::FlowConfig;
use crate::error::{Error, Result};

/// Parse a flow from a JSON or YAML string.
pub fn parse_flow(source: &str) -> Result<FlowConfig> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(Error::Parse("Empty flow definition".to_string()));
    }

    if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).map_err(|e| describe(&e.to_string()))
    } else {
        serde_yaml::from_str(trimmed).map_err(|e| describe(&e.to_string()))
    }
}

/// Parse a flow from a file path.
pub fn parse_flow_file(path: &Path) -> Result<FlowConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_flow(&content)
}

fn describe(message: &str) -> Error {
    if let Some(field) = extract_missing_field(message) {
        Error::Parse(format!("Missing required field: {}", field))
    } else {
        Error::Parse(format!("Invalid flow document: {}", message))
    }
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}
