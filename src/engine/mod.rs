//! Execution engine: lifecycle of suite executions and the worker boundary.

mod lifecycle;
mod worker;

pub use lifecycle::{DispatchReceipt, LifecycleController, StopReceipt};
pub use worker::{DispatchPayload, ExecutionWorker, HttpWorker};
