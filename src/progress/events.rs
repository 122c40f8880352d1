//! Events emitted on progress and log channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::storage::{ExecutionHierarchy, ExecutionLog, ExecutionStatus};

/// Connect-time metadata plus the full hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitData {
    pub execution_id: String,
    pub suite_id: String,
    pub suite_name: String,
    pub status: ExecutionStatus,
    pub total_cases: i64,
    pub total_steps: i64,
    pub start_time: DateTime<Utc>,
    pub hierarchy: ExecutionHierarchy,
}

/// Final counts of a terminal execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub status: ExecutionStatus,
    pub total_cases: i64,
    pub passed_cases: i64,
    pub failed_cases: i64,
    pub skipped_cases: i64,
    pub total_steps: i64,
    pub passed_steps: i64,
    pub failed_steps: i64,
    pub pass_rate: i64,
    pub duration: Option<i64>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ExecutionSummary {
    pub fn of(hierarchy: &ExecutionHierarchy) -> Self {
        let e = &hierarchy.execution;
        Self {
            status: e.status,
            total_cases: e.total_cases,
            passed_cases: e.passed_cases,
            failed_cases: e.failed_cases,
            skipped_cases: e.skipped_cases,
            total_steps: e.total_steps,
            passed_steps: e.passed_steps,
            failed_steps: e.failed_steps,
            pass_rate: e.pass_rate(),
            duration: e.duration,
            end_time: e.end_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteData {
    pub summary: ExecutionSummary,
    pub hierarchy: ExecutionHierarchy,
}

/// One frame on a progress channel. Every frame carries a full snapshot,
/// never a delta.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Init(Box<InitData>),
    Update(Box<ExecutionHierarchy>),
    Complete(Box<CompleteData>),
    Timeout { message: String },
    Error { message: String },
    Heartbeat,
}

impl ProgressEvent {
    pub fn init(hierarchy: &ExecutionHierarchy) -> Self {
        let e = &hierarchy.execution;
        Self::Init(Box::new(InitData {
            execution_id: e.id.clone(),
            suite_id: e.suite_id.clone(),
            suite_name: e.suite_name.clone(),
            status: e.status,
            total_cases: e.total_cases,
            total_steps: e.total_steps,
            start_time: e.start_time,
            hierarchy: hierarchy.clone(),
        }))
    }

    pub fn complete(hierarchy: ExecutionHierarchy) -> Self {
        Self::Complete(Box::new(CompleteData {
            summary: ExecutionSummary::of(&hierarchy),
            hierarchy,
        }))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Update(_) => "update",
            Self::Complete(_) => "complete",
            Self::Timeout { .. } => "timeout",
            Self::Error { .. } => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    pub fn data(&self) -> Value {
        let value = match self {
            Self::Init(data) => serde_json::to_value(data),
            Self::Update(hierarchy) => serde_json::to_value(hierarchy),
            Self::Complete(data) => serde_json::to_value(data),
            Self::Timeout { message } | Self::Error { message } => {
                return json!({ "message": message })
            }
            Self::Heartbeat => return Value::Null,
        };
        value.unwrap_or_else(|e| json!({ "message": format!("Failed to encode event: {}", e) }))
    }

    /// Whether the channel closes after this event.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Complete(_) | Self::Timeout { .. } | Self::Error { .. }
        )
    }
}

/// One frame on a live log channel.
#[derive(Debug, Clone)]
pub enum LogEvent {
    Log(Box<ExecutionLog>),
    End { status: ExecutionStatus },
    Timeout { message: String },
    Error { message: String },
    Heartbeat,
}

impl LogEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::End { .. } => "end",
            Self::Timeout { .. } => "timeout",
            Self::Error { .. } => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::Log(log) => serde_json::to_value(log).unwrap_or(Value::Null),
            Self::End { status } => json!({ "status": status }),
            Self::Timeout { message } | Self::Error { message } => json!({ "message": message }),
            Self::Heartbeat => Value::Null,
        }
    }
}
