//! Test-case flows: the node/edge graph authored for one test case.
//!
//! - `types`: the flow document (camelCase JSON/YAML)
//! - `graph`: structural checks, cycle detection and linearization
//! - `variables`: cross-step references and the worker-side resolution helpers
//! - `steps`: projection into ordered test steps

mod graph;
mod parser;
mod steps;
mod types;
mod variables;

pub use graph::{validate, FlowGraph, LinearOrder, ValidationError};
pub use parser::{parse_flow, parse_flow_file};
pub use steps::{validate_flow, TestStep, ValidatedFlow};
pub use types::*;
pub use variables::{
    apply_template, collect_references, parse_step_variable, resolve_path, validate_references,
    StepReference, TEMPLATE_PLACEHOLDER,
};
