//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::{FlowConfig, TestStep};

/// Status of a suite, case or step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    #[serde(alias = "success", alias = "passed")]
    Completed,
    Failed,
    Stopped,
    /// Case and step rows only.
    Skipped,
}

impl ExecutionStatus {
    /// Terminal rows are never transitioned again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Skipped => "skipped",
        }
    }

    /// Read a stored status. Unknown values read as failed.
    pub fn from_db(s: &str) -> Self {
        s.parse().unwrap_or(Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" | "success" | "passed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Stored test case with its derived steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTestCase {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// `None` when the stored document no longer parses.
    pub flow_config: Option<FlowConfig>,
    pub steps: Vec<TestStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Membership of a test case in a suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteCaseEntry {
    pub test_case_id: String,
    pub order: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Stored test suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub use_global_settings: bool,
    /// Suite-specific environment, used when `use_global_settings` is off.
    #[serde(default)]
    pub environment_config: Option<Value>,
    #[serde(default)]
    pub test_cases: Vec<SuiteCaseEntry>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// A suite's enabled case, ready to be expanded into execution rows.
#[derive(Debug, Clone)]
pub struct PlannedCase {
    pub test_case_id: String,
    pub test_case_name: String,
    pub steps: Vec<TestStep>,
}

/// Where an environment snapshot was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Global,
    Suite,
}

/// Environment captured once when an execution is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSnapshot {
    pub source: SnapshotSource,
    pub snapshot_time: DateTime<Utc>,
    pub config: Value,
}

// ============================================================================
// Execution hierarchy
// ============================================================================

/// Everything needed to create one suite execution.
#[derive(Debug, Clone)]
pub struct HierarchyPlan {
    pub suite_id: String,
    pub suite_name: String,
    /// Serialized once; stored and later reused verbatim.
    pub environment_snapshot: String,
    pub triggered_by: String,
    pub cases: Vec<PlannedCase>,
}

/// Ids assigned by `create_hierarchy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedHierarchy {
    pub execution_id: String,
    pub total_cases: i64,
    pub total_steps: i64,
    pub cases: Vec<CreatedCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedCase {
    pub case_execution_id: String,
    pub test_case_id: String,
    pub test_case_name: String,
    pub order: i64,
    pub steps: Vec<CreatedStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedStep {
    pub step_execution_id: String,
    pub node_id: String,
    pub node_name: String,
    pub order: i64,
    pub is_cleanup: bool,
    pub config: Value,
}

/// What a retry needs from the original execution, read verbatim.
#[derive(Debug, Clone)]
pub struct ExecutionOrigin {
    pub suite_id: String,
    pub suite_name: String,
    pub environment_snapshot: Option<String>,
}

/// Suite execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteExecution {
    pub id: String,
    pub suite_id: String,
    pub suite_name: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds.
    pub duration: Option<i64>,
    pub environment_snapshot: Option<Value>,
    pub total_cases: i64,
    pub passed_cases: i64,
    pub failed_cases: i64,
    pub skipped_cases: i64,
    pub total_steps: i64,
    pub passed_steps: i64,
    pub failed_steps: i64,
    pub triggered_by: String,
    pub error_message: Option<String>,
}

impl SuiteExecution {
    /// Passed cases as a rounded percentage of all cases.
    pub fn pass_rate(&self) -> i64 {
        if self.total_cases <= 0 {
            return 0;
        }
        ((self.passed_cases as f64 / self.total_cases as f64) * 100.0).round() as i64
    }
}

/// Case execution record, with its steps when loaded as part of a hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseExecution {
    pub id: String,
    pub suite_execution_id: String,
    pub test_case_id: String,
    pub test_case_name: String,
    pub order: i64,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub total_steps: i64,
    pub passed_steps: i64,
    pub failed_steps: i64,
    pub error_message: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepExecution>,
}

/// Step execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: String,
    pub case_execution_id: String,
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub order: i64,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub node_snapshot: Option<Value>,
    pub request_url: Option<String>,
    pub request_method: Option<String>,
    pub request_headers: Option<Value>,
    pub request_body: Option<Value>,
    pub request_params: Option<Value>,
    pub response_status: Option<i64>,
    pub response_headers: Option<Value>,
    pub response_body: Option<Value>,
    pub assertion_results: Option<Value>,
    pub extracted_variables: Option<Value>,
    pub error_message: Option<String>,
}

/// Full suite → case → step snapshot, read in one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHierarchy {
    pub execution: SuiteExecution,
    pub cases: Vec<CaseExecution>,
}

impl ExecutionHierarchy {
    pub fn is_terminal(&self) -> bool {
        self.execution.status.is_terminal()
    }
}

// ============================================================================
// Worker reports
// ============================================================================

/// Result of one step, reported by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepReport {
    pub status: Option<ExecutionStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub node_snapshot: Option<Value>,
    pub request_url: Option<String>,
    pub request_method: Option<String>,
    pub request_headers: Option<Value>,
    pub request_body: Option<Value>,
    pub request_params: Option<Value>,
    pub response_status: Option<i64>,
    pub response_headers: Option<Value>,
    pub response_body: Option<Value>,
    pub assertion_results: Option<Value>,
    pub extracted_variables: Option<Value>,
    pub error_message: Option<String>,
}

/// Result of one case, reported by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseReport {
    pub status: Option<ExecutionStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub error_message: Option<String>,
}

/// Result of a whole suite, reported by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteReport {
    pub status: Option<ExecutionStatus>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub error_message: Option<String>,
}

/// Outcome of a stop, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOutcome {
    pub stopped_steps: usize,
    pub stopped_cases: usize,
    pub duration: i64,
    pub end_time: DateTime<Utc>,
}

// ============================================================================
// Logs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "debug" => Self::Debug,
            "success" => Self::Success,
            "warning" | "warn" => Self::Warning,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    System,
    Request,
    Response,
    Assertion,
    Variable,
    Error,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Request => "request",
            Self::Response => "response",
            Self::Assertion => "assertion",
            Self::Variable => "variable",
            Self::Error => "error",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "request" => Self::Request,
            "response" => Self::Response,
            "assertion" => Self::Assertion,
            "variable" => Self::Variable,
            "error" => Self::Error,
            _ => Self::System,
        }
    }
}

/// Row a log entry is attached to. Parent ids are filled in on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum LogScope {
    Suite(String),
    Case(String),
    Step(String),
}

/// Log entry to append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub level: LogLevel,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
}

impl NewLogEntry {
    pub fn system(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            log_type: LogType::System,
            message: message.into(),
            details: None,
            node_id: None,
            node_name: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Persisted log entry. `id` increases monotonically and serves as a cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub suite_execution_id: Option<String>,
    pub case_execution_id: Option<String>,
    pub step_execution_id: Option<String>,
    pub level: LogLevel,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub message: String,
    pub details: Option<Value>,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
}

/// Default number of log rows returned by a query.
pub const DEFAULT_LOG_LIMIT: usize = 1000;

/// Filters for log queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub suite_execution_id: Option<String>,
    pub case_execution_id: Option<String>,
    pub step_execution_id: Option<String>,
    pub level: Option<LogLevel>,
    pub limit: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            suite_execution_id: None,
            case_execution_id: None,
            step_execution_id: None,
            level: None,
            limit: DEFAULT_LOG_LIMIT,
        }
    }
}

// ============================================================================
// History
// ============================================================================

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;
/// Highest page whose row offset still fits an SQLite integer.
pub const MAX_PAGE: usize = i64::MAX as usize / MAX_PAGE_SIZE;

/// Filters for the execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionListQuery {
    pub suite_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for ExecutionListQuery {
    fn default() -> Self {
        Self {
            suite_id: None,
            status: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ExecutionListQuery {
    /// Page and page size clamped to valid values.
    pub fn normalized(&self) -> (usize, usize) {
        let page = self.page.clamp(1, MAX_PAGE);
        let page_size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        (page, page_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionListItem {
    #[serde(flatten)]
    pub execution: SuiteExecution,
    pub pass_rate: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pages: usize,
}

/// Counts over every execution in scope, ignoring the status filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPage {
    pub executions: Vec<ExecutionListItem>,
    pub pagination: Pagination,
    pub stats: ExecutionStats,
}

/// Database health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub foreign_keys_enabled: bool,
    pub integrity_check: String,
    pub foreign_key_violations: Vec<String>,
    pub orphaned_case_executions: u64,
    pub orphaned_step_executions: u64,
    pub journal_mode: String,
    pub busy_timeout_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_legacy_spellings() {
        assert_eq!(ExecutionStatus::from_db("success"), ExecutionStatus::Completed);
        assert_eq!(ExecutionStatus::from_db("passed"), ExecutionStatus::Completed);
        assert_eq!(ExecutionStatus::from_db("stopped"), ExecutionStatus::Stopped);
        assert_eq!(ExecutionStatus::from_db("exploded"), ExecutionStatus::Failed);

        let report: StepReport = serde_json::from_str(r#"{"status": "success"}"#).unwrap();
        assert_eq!(report.status, Some(ExecutionStatus::Completed));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Stopped.is_terminal());
        assert!(ExecutionStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_page_normalization() {
        let q = ExecutionListQuery {
            page: 0,
            page_size: 500,
            ..Default::default()
        };
        assert_eq!(q.normalized(), (1, MAX_PAGE_SIZE));
        assert_eq!(ExecutionListQuery::default().normalized(), (1, 20));

        let far = ExecutionListQuery {
            page: usize::MAX,
            page_size: usize::MAX,
            ..Default::default()
        };
        let (page, page_size) = far.normalized();
        assert_eq!((page, page_size), (MAX_PAGE, MAX_PAGE_SIZE));
        assert!(((page - 1) * page_size) as u64 <= i64::MAX as u64);
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = EnvironmentSnapshot {
            source: SnapshotSource::Global,
            snapshot_time: Utc::now(),
            config: serde_json::json!({"baseUrl": "https://a.example"}),
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["source"], "global");
        assert!(value.get("snapshotTime").is_some());
    }
}
