//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::*;
use crate::error::{Error, Result};
use crate::flow::{validate_flow, FlowConfig, NodeKind, TestStep};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// JSON stored as text. A value that no longer parses reads as `None`.
fn parse_json_lenient(s: Option<String>) -> Option<Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn json_text(value: Option<&Value>) -> Option<String> {
    value.and_then(|v| serde_json::to_string(v).ok())
}

fn millis_between(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Option<i64> {
    start.map(|s| (end - s).num_milliseconds().max(0))
}

/// Status filter matching rows that may still transition.
const NON_TERMINAL: &str = "('pending', 'running')";

const SUITE_EXECUTION_COLUMNS: &str = "id, suite_id, suite_name, status, start_time, end_time, duration, environment_snapshot, total_cases, passed_cases, failed_cases, skipped_cases, total_steps, passed_steps, failed_steps, triggered_by, error_message";

const CASE_EXECUTION_COLUMNS: &str = "id, suite_execution_id, test_case_id, test_case_name, case_order, status, start_time, end_time, duration, total_steps, passed_steps, failed_steps, error_message";

const STEP_EXECUTION_COLUMNS: &str = "id, case_execution_id, node_id, node_name, node_type, step_order, status, start_time, end_time, duration, node_snapshot, request_url, request_method, request_headers, request_body, request_params, response_status, response_headers, response_body, assertion_results, extracted_variables, error_message";

const LOG_COLUMNS: &str = "id, timestamp, suite_execution_id, case_execution_id, step_execution_id, level, log_type, message, details, node_id, node_name";

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init_schema_sync(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS test_cases (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                flow_config TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS test_steps (
                id TEXT PRIMARY KEY,
                test_case_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                name TEXT NOT NULL,
                step_type TEXT NOT NULL,
                api_id TEXT,
                step_order INTEGER NOT NULL,
                is_cleanup INTEGER NOT NULL DEFAULT 0,
                config TEXT NOT NULL,
                FOREIGN KEY (test_case_id) REFERENCES test_cases(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS test_suites (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                use_global_settings INTEGER NOT NULL DEFAULT 1,
                environment_config TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS suite_test_cases (
                suite_id TEXT NOT NULL,
                test_case_id TEXT NOT NULL,
                case_order INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (suite_id, test_case_id),
                FOREIGN KEY (suite_id) REFERENCES test_suites(id) ON DELETE CASCADE,
                FOREIGN KEY (test_case_id) REFERENCES test_cases(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS platform_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                config TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS suite_executions (
                id TEXT PRIMARY KEY,
                suite_id TEXT NOT NULL,
                suite_name TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration INTEGER,
                environment_snapshot TEXT,
                total_cases INTEGER NOT NULL DEFAULT 0,
                passed_cases INTEGER NOT NULL DEFAULT 0,
                failed_cases INTEGER NOT NULL DEFAULT 0,
                skipped_cases INTEGER NOT NULL DEFAULT 0,
                total_steps INTEGER NOT NULL DEFAULT 0,
                passed_steps INTEGER NOT NULL DEFAULT 0,
                failed_steps INTEGER NOT NULL DEFAULT 0,
                triggered_by TEXT NOT NULL,
                error_message TEXT
            );

            CREATE TABLE IF NOT EXISTS case_executions (
                id TEXT PRIMARY KEY,
                suite_execution_id TEXT NOT NULL,
                test_case_id TEXT NOT NULL,
                test_case_name TEXT NOT NULL,
                case_order INTEGER NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                duration INTEGER,
                total_steps INTEGER NOT NULL DEFAULT 0,
                passed_steps INTEGER NOT NULL DEFAULT 0,
                failed_steps INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                FOREIGN KEY (suite_execution_id) REFERENCES suite_executions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS step_executions (
                id TEXT PRIMARY KEY,
                case_execution_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_name TEXT NOT NULL,
                node_type TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                duration INTEGER,
                node_snapshot TEXT,
                request_url TEXT,
                request_method TEXT,
                request_headers TEXT,
                request_body TEXT,
                request_params TEXT,
                response_status INTEGER,
                response_headers TEXT,
                response_body TEXT,
                assertion_results TEXT,
                extracted_variables TEXT,
                error_message TEXT,
                FOREIGN KEY (case_execution_id) REFERENCES case_executions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                suite_execution_id TEXT,
                case_execution_id TEXT,
                step_execution_id TEXT,
                level TEXT NOT NULL,
                log_type TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT,
                node_id TEXT,
                node_name TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_test_steps_case ON test_steps(test_case_id, step_order);
            CREATE INDEX IF NOT EXISTS idx_suite_test_cases_suite ON suite_test_cases(suite_id, case_order);
            CREATE INDEX IF NOT EXISTS idx_suite_executions_suite ON suite_executions(suite_id, start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_case_executions_suite ON case_executions(suite_execution_id, case_order);
            CREATE INDEX IF NOT EXISTS idx_step_executions_case ON step_executions(case_execution_id, step_order);
            CREATE INDEX IF NOT EXISTS idx_execution_logs_suite ON execution_logs(suite_execution_id, id);
            CREATE INDEX IF NOT EXISTS idx_execution_logs_case ON execution_logs(case_execution_id, id);
            CREATE INDEX IF NOT EXISTS idx_execution_logs_step ON execution_logs(step_execution_id, id);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Test cases
    // ========================================================================

    /// Validate a flow and store it, regenerating its steps.
    ///
    /// An invalid flow is rejected before anything is written.
    pub async fn save_test_case(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        flow: &FlowConfig,
    ) -> Result<StoredTestCase> {
        let validated = validate_flow(flow)?;
        let flow_text = serde_json::to_string(flow)?;
        let now = Utc::now();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let created_at: Option<String> = tx
            .query_row(
                "SELECT created_at FROM test_cases WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;

        if created_at.is_some() {
            tx.execute(
                "UPDATE test_cases SET name = ?1, description = ?2, flow_config = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![name, description, flow_text, now.to_rfc3339(), id],
            )?;
        } else {
            tx.execute(
                "INSERT INTO test_cases (id, name, description, flow_config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, name, description, flow_text, now.to_rfc3339()],
            )?;
        }

        tx.execute("DELETE FROM test_steps WHERE test_case_id = ?1", [id])?;
        for step in &validated.steps {
            tx.execute(
                "INSERT INTO test_steps
                 (id, test_case_id, node_id, name, step_type, api_id, step_order, is_cleanup, config)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    Uuid::new_v4().to_string(),
                    id,
                    step.node_id,
                    step.name,
                    step.step_type.to_string(),
                    step.api_id,
                    step.order as i64,
                    step.is_cleanup,
                    serde_json::to_string(&step.config)?,
                ],
            )?;
        }
        tx.commit()?;

        Ok(StoredTestCase {
            id: id.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            flow_config: Some(flow.clone()),
            steps: validated.steps,
            created_at: parse_optional_datetime(created_at).unwrap_or(now),
            updated_at: now,
        })
    }

    pub async fn get_test_case(&self, id: &str) -> Result<Option<StoredTestCase>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, name, description, flow_config, created_at, updated_at
                 FROM test_cases WHERE id = ?1",
                [id],
                |row| {
                    let flow_text: String = row.get(3)?;
                    Ok(StoredTestCase {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        flow_config: serde_json::from_str(&flow_text).ok(),
                        steps: Vec::new(),
                        created_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
                        updated_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
                    })
                },
            )
            .optional()?;

        let Some(mut test_case) = row else {
            return Ok(None);
        };
        test_case.steps = Self::load_test_steps(&conn, id)?;
        Ok(Some(test_case))
    }

    fn load_test_steps(conn: &Connection, test_case_id: &str) -> Result<Vec<TestStep>> {
        let mut stmt = conn.prepare(
            "SELECT node_id, name, step_type, api_id, step_order, is_cleanup, config
             FROM test_steps WHERE test_case_id = ?1 ORDER BY step_order",
        )?;
        let steps = stmt
            .query_map([test_case_id], |row| {
                let step_type: String = row.get(2)?;
                let config: Option<String> = row.get(6)?;
                Ok(TestStep {
                    node_id: row.get(0)?,
                    name: row.get(1)?,
                    step_type: serde_json::from_value(Value::String(step_type))
                        .unwrap_or(NodeKind::Api),
                    api_id: row.get(3)?,
                    order: row.get::<_, i64>(4)?.max(0) as u32,
                    is_cleanup: row.get(5)?,
                    config: parse_json_lenient(config).unwrap_or(Value::Null),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    // ========================================================================
    // Suites and settings
    // ========================================================================

    /// Insert or replace a suite and its case list.
    pub async fn save_suite(&self, suite: &TestSuite) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        for entry in &suite.test_cases {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM test_cases WHERE id = ?1",
                    [entry.test_case_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(Error::NotFound(format!(
                    "test case '{}'",
                    entry.test_case_id
                )));
            }
        }

        tx.execute(
            "INSERT INTO test_suites
             (id, name, description, use_global_settings, environment_config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                use_global_settings = excluded.use_global_settings,
                environment_config = excluded.environment_config,
                updated_at = excluded.updated_at",
            params![
                suite.id,
                suite.name,
                suite.description,
                suite.use_global_settings,
                json_text(suite.environment_config.as_ref()),
                suite.created_at.to_rfc3339(),
                suite.updated_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "DELETE FROM suite_test_cases WHERE suite_id = ?1",
            [suite.id.as_str()],
        )?;
        for entry in &suite.test_cases {
            tx.execute(
                "INSERT INTO suite_test_cases (suite_id, test_case_id, case_order, enabled)
                 VALUES (?1, ?2, ?3, ?4)",
                params![suite.id, entry.test_case_id, entry.order, entry.enabled],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub async fn get_suite(&self, id: &str) -> Result<Option<TestSuite>> {
        let conn = self.conn.lock().await;
        let suite = conn
            .query_row(
                "SELECT id, name, description, use_global_settings, environment_config, created_at, updated_at
                 FROM test_suites WHERE id = ?1",
                [id],
                |row| {
                    Ok(TestSuite {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        use_global_settings: row.get(3)?,
                        environment_config: parse_json_lenient(row.get(4)?),
                        test_cases: Vec::new(),
                        created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
                        updated_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
                    })
                },
            )
            .optional()?;

        let Some(mut suite) = suite else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT test_case_id, case_order, enabled FROM suite_test_cases
             WHERE suite_id = ?1 ORDER BY case_order, test_case_id",
        )?;
        suite.test_cases = stmt
            .query_map([id], |row| {
                Ok(SuiteCaseEntry {
                    test_case_id: row.get(0)?,
                    order: row.get(1)?,
                    enabled: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(suite))
    }

    /// Enabled cases of a suite in suite order, with their steps.
    pub async fn get_enabled_cases(&self, suite_id: &str) -> Result<Vec<PlannedCase>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name FROM suite_test_cases sc
             JOIN test_cases c ON c.id = sc.test_case_id
             WHERE sc.suite_id = ?1 AND sc.enabled = 1
             ORDER BY sc.case_order, c.id",
        )?;
        let cases: Vec<(String, String)> = stmt
            .query_map([suite_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        cases
            .into_iter()
            .map(|(id, name)| {
                let steps = Self::load_test_steps(&conn, &id)?;
                Ok(PlannedCase {
                    test_case_id: id,
                    test_case_name: name,
                    steps,
                })
            })
            .collect()
    }

    /// Global platform settings document.
    pub async fn get_settings(&self) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let config: Option<String> = conn
            .query_row(
                "SELECT config FROM platform_settings WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(parse_json_lenient(config))
    }

    pub async fn save_settings(&self, settings: &Value) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO platform_settings (id, config, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET config = excluded.config, updated_at = excluded.updated_at",
            params![serde_json::to_string(settings)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ========================================================================
    // Execution hierarchy
    // ========================================================================

    /// Create the suite row and, in the same transaction, every case and
    /// step row. All rows start as pending.
    pub async fn create_hierarchy(&self, plan: &HierarchyPlan) -> Result<CreatedHierarchy> {
        let execution_id = Uuid::new_v4().to_string();
        let total_cases = plan.cases.len() as i64;
        let total_steps: i64 = plan.cases.iter().map(|c| c.steps.len() as i64).sum();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO suite_executions
             (id, suite_id, suite_name, status, start_time, environment_snapshot, total_cases, total_steps, triggered_by)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8)",
            params![
                execution_id,
                plan.suite_id,
                plan.suite_name,
                now,
                plan.environment_snapshot,
                total_cases,
                total_steps,
                plan.triggered_by,
            ],
        )?;

        let mut cases = Vec::with_capacity(plan.cases.len());
        for (case_index, case) in plan.cases.iter().enumerate() {
            let case_execution_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO case_executions
                 (id, suite_execution_id, test_case_id, test_case_name, case_order, status, total_steps)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![
                    case_execution_id,
                    execution_id,
                    case.test_case_id,
                    case.test_case_name,
                    case_index as i64,
                    case.steps.len() as i64,
                ],
            )?;

            let mut steps = Vec::with_capacity(case.steps.len());
            for step in &case.steps {
                let step_execution_id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO step_executions
                     (id, case_execution_id, node_id, node_name, node_type, step_order, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
                    params![
                        step_execution_id,
                        case_execution_id,
                        step.node_id,
                        step.name,
                        step.step_type.to_string(),
                        step.order as i64,
                    ],
                )?;
                steps.push(CreatedStep {
                    step_execution_id,
                    node_id: step.node_id.clone(),
                    node_name: step.name.clone(),
                    order: step.order as i64,
                    is_cleanup: step.is_cleanup,
                    config: step.config.clone(),
                });
            }

            cases.push(CreatedCase {
                case_execution_id,
                test_case_id: case.test_case_id.clone(),
                test_case_name: case.test_case_name.clone(),
                order: case_index as i64,
                steps,
            });
        }

        tx.commit()?;

        Ok(CreatedHierarchy {
            execution_id,
            total_cases,
            total_steps,
            cases,
        })
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<SuiteExecution>> {
        let conn = self.conn.lock().await;
        Self::load_suite_execution(&conn, id)
    }

    fn load_suite_execution(conn: &Connection, id: &str) -> Result<Option<SuiteExecution>> {
        let sql = format!(
            "SELECT {} FROM suite_executions WHERE id = ?1",
            SUITE_EXECUTION_COLUMNS
        );
        let execution = conn
            .query_row(&sql, [id], Self::row_to_suite_execution)
            .optional()?;
        Ok(execution)
    }

    /// Full hierarchy in one read under a single lock.
    pub async fn get_hierarchy(&self, id: &str) -> Result<Option<ExecutionHierarchy>> {
        let conn = self.conn.lock().await;
        let Some(execution) = Self::load_suite_execution(&conn, id)? else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT {} FROM case_executions WHERE suite_execution_id = ?1 ORDER BY case_order",
            CASE_EXECUTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut cases = stmt
            .query_map([id], Self::row_to_case_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let sql = format!(
            "SELECT {} FROM step_executions
             WHERE case_execution_id IN (SELECT id FROM case_executions WHERE suite_execution_id = ?1)
             ORDER BY step_order",
            STEP_EXECUTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let steps = stmt
            .query_map([id], Self::row_to_step_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for step in steps {
            if let Some(case) = cases.iter_mut().find(|c| c.id == step.case_execution_id) {
                case.steps.push(step);
            }
        }

        Ok(Some(ExecutionHierarchy { execution, cases }))
    }

    /// Suite id and the stored environment snapshot text, untouched.
    pub async fn get_execution_origin(&self, id: &str) -> Result<Option<ExecutionOrigin>> {
        let conn = self.conn.lock().await;
        let origin = conn
            .query_row(
                "SELECT suite_id, suite_name, environment_snapshot FROM suite_executions WHERE id = ?1",
                [id],
                |row| {
                    Ok(ExecutionOrigin {
                        suite_id: row.get(0)?,
                        suite_name: row.get(1)?,
                        environment_snapshot: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(origin)
    }

    pub async fn get_step_execution(&self, id: &str) -> Result<Option<StepExecution>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM step_executions WHERE id = ?1",
            STEP_EXECUTION_COLUMNS
        );
        let step = conn
            .query_row(&sql, [id], Self::row_to_step_execution)
            .optional()?;
        Ok(step)
    }

    /// `pending -> running`, only if the suite is still pending.
    ///
    /// Returns false when another writer already moved the suite on.
    pub async fn mark_suite_running(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE suite_executions SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            [id],
        )?;
        Ok(changed > 0)
    }

    /// Conditionally move a suite execution to `status`.
    ///
    /// `running` applies only to a pending suite; terminal statuses apply only
    /// to a pending or running suite. Returns whether a row changed.
    pub async fn transition_suite(&self, id: &str, report: &SuiteReport) -> Result<bool> {
        let conn = self.conn.lock().await;
        Self::transition_suite_sync(&conn, id, report)
    }

    fn transition_suite_sync(conn: &Connection, id: &str, report: &SuiteReport) -> Result<bool> {
        let Some(status) = report.status else {
            return Err(Error::InvalidState("suite report has no status".into()));
        };
        let start_time: Option<String> = conn
            .query_row(
                "SELECT start_time FROM suite_executions WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(start_time) = start_time else {
            return Err(Error::NotFound(format!("execution '{}'", id)));
        };

        let changed = match status {
            ExecutionStatus::Pending | ExecutionStatus::Skipped => {
                return Err(Error::InvalidState(format!(
                    "a suite execution cannot move to {}",
                    status
                )));
            }
            ExecutionStatus::Running => conn.execute(
                "UPDATE suite_executions SET status = 'running' WHERE id = ?1 AND status = 'pending'",
                [id],
            )?,
            terminal => {
                let end_time = report.end_time.unwrap_or_else(Utc::now);
                let duration = report.duration.or_else(|| {
                    millis_between(parse_optional_datetime(Some(start_time)), end_time)
                });
                conn.execute(
                    &format!(
                        "UPDATE suite_executions
                         SET status = ?1, end_time = ?2, duration = ?3,
                             error_message = COALESCE(?4, error_message)
                         WHERE id = ?5 AND status IN {}",
                        NON_TERMINAL
                    ),
                    params![
                        terminal.as_str(),
                        end_time.to_rfc3339(),
                        duration,
                        report.error_message,
                        id
                    ],
                )?
            }
        };
        Ok(changed > 0)
    }

    /// Apply a step result reported by the worker.
    ///
    /// Captured request/response fields are write-once. A terminal step is
    /// never changed. Parent counts are recomputed when the row changed.
    pub async fn report_step(&self, id: &str, report: &StepReport) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let current: Option<(String, Option<String>, String, String)> = tx
            .query_row(
                "SELECT s.status, s.start_time, s.case_execution_id, c.suite_execution_id
                 FROM step_executions s JOIN case_executions c ON c.id = s.case_execution_id
                 WHERE s.id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((status, start_time, case_id, suite_id)) = current else {
            return Err(Error::NotFound(format!("step execution '{}'", id)));
        };
        let status = ExecutionStatus::from_db(&status);
        if status.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        let (start, end, duration) = match report.status {
            Some(ExecutionStatus::Pending) => {
                return Err(Error::InvalidState(
                    "a step cannot move back to pending".into(),
                ))
            }
            Some(ExecutionStatus::Running) => (Some(report.start_time.unwrap_or(now)), None, None),
            Some(_) => {
                let end = report.end_time.unwrap_or(now);
                let start = report
                    .start_time
                    .or_else(|| parse_optional_datetime(start_time));
                (
                    start,
                    Some(end),
                    report.duration.or_else(|| millis_between(start, end)),
                )
            }
            None => (report.start_time, report.end_time, report.duration),
        };

        let changed = tx.execute(
            &format!(
                "UPDATE step_executions SET
                    status = COALESCE(?1, status),
                    start_time = COALESCE(start_time, ?2),
                    end_time = COALESCE(?3, end_time),
                    duration = COALESCE(?4, duration),
                    node_snapshot = COALESCE(node_snapshot, ?5),
                    request_url = COALESCE(request_url, ?6),
                    request_method = COALESCE(request_method, ?7),
                    request_headers = COALESCE(request_headers, ?8),
                    request_body = COALESCE(request_body, ?9),
                    request_params = COALESCE(request_params, ?10),
                    response_status = COALESCE(response_status, ?11),
                    response_headers = COALESCE(response_headers, ?12),
                    response_body = COALESCE(response_body, ?13),
                    assertion_results = COALESCE(assertion_results, ?14),
                    extracted_variables = COALESCE(extracted_variables, ?15),
                    error_message = COALESCE(?16, error_message)
                 WHERE id = ?17 AND status IN {}",
                NON_TERMINAL
            ),
            params![
                report.status.map(|s| s.as_str()),
                start.map(|t| t.to_rfc3339()),
                end.map(|t| t.to_rfc3339()),
                duration,
                json_text(report.node_snapshot.as_ref()),
                report.request_url,
                report.request_method,
                json_text(report.request_headers.as_ref()),
                json_text(report.request_body.as_ref()),
                json_text(report.request_params.as_ref()),
                report.response_status,
                json_text(report.response_headers.as_ref()),
                json_text(report.response_body.as_ref()),
                json_text(report.assertion_results.as_ref()),
                json_text(report.extracted_variables.as_ref()),
                report.error_message,
                id,
            ],
        )?;

        if changed > 0 {
            if report.status == Some(ExecutionStatus::Running) {
                tx.execute(
                    "UPDATE case_executions SET status = 'running', start_time = COALESCE(start_time, ?1)
                     WHERE id = ?2 AND status = 'pending'",
                    params![now.to_rfc3339(), case_id],
                )?;
            }
            Self::refresh_case_counts(&tx, &case_id)?;
            Self::refresh_suite_counts(&tx, &suite_id)?;
        }

        tx.commit()?;
        Ok(changed > 0)
    }

    /// Apply a case result reported by the worker.
    ///
    /// Once every case of the suite is terminal the suite itself becomes
    /// `failed` if any case failed, `completed` otherwise.
    pub async fn report_case(&self, id: &str, report: &CaseReport) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let current: Option<(String, Option<String>, String)> = tx
            .query_row(
                "SELECT status, start_time, suite_execution_id FROM case_executions WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((status, start_time, suite_id)) = current else {
            return Err(Error::NotFound(format!("case execution '{}'", id)));
        };
        if ExecutionStatus::from_db(&status).is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        let changed = match report.status {
            None | Some(ExecutionStatus::Pending) => {
                return Err(Error::InvalidState(
                    "case report must carry running or a terminal status".into(),
                ))
            }
            Some(ExecutionStatus::Running) => tx.execute(
                "UPDATE case_executions SET status = 'running', start_time = COALESCE(start_time, ?1)
                 WHERE id = ?2 AND status = 'pending'",
                params![report.start_time.unwrap_or(now).to_rfc3339(), id],
            )?,
            Some(terminal) => {
                let end = report.end_time.unwrap_or(now);
                let start = report
                    .start_time
                    .or_else(|| parse_optional_datetime(start_time));
                let duration = report.duration.or_else(|| millis_between(start, end));
                tx.execute(
                    &format!(
                        "UPDATE case_executions SET status = ?1,
                            start_time = COALESCE(start_time, ?2),
                            end_time = ?3, duration = ?4,
                            error_message = COALESCE(?5, error_message)
                         WHERE id = ?6 AND status IN {}",
                        NON_TERMINAL
                    ),
                    params![
                        terminal.as_str(),
                        start.map(|t| t.to_rfc3339()),
                        end.to_rfc3339(),
                        duration,
                        report.error_message,
                        id,
                    ],
                )?
            }
        };

        if changed > 0 {
            Self::refresh_suite_counts(&tx, &suite_id)?;
            Self::finalize_suite_if_done(&tx, &suite_id)?;
        }

        tx.commit()?;
        Ok(changed > 0)
    }

    fn refresh_case_counts(conn: &Connection, case_id: &str) -> Result<()> {
        conn.execute(
            &format!(
                "UPDATE case_executions SET
                    passed_steps = (SELECT COUNT(*) FROM step_executions
                                    WHERE case_execution_id = ?1 AND status = 'completed'),
                    failed_steps = (SELECT COUNT(*) FROM step_executions
                                    WHERE case_execution_id = ?1 AND status = 'failed')
                 WHERE id = ?1 AND status IN {}",
                NON_TERMINAL
            ),
            [case_id],
        )?;
        Ok(())
    }

    fn refresh_suite_counts(conn: &Connection, suite_id: &str) -> Result<()> {
        conn.execute(
            &format!(
                "UPDATE suite_executions SET
                    passed_cases = (SELECT COUNT(*) FROM case_executions
                                    WHERE suite_execution_id = ?1 AND status = 'completed'),
                    failed_cases = (SELECT COUNT(*) FROM case_executions
                                    WHERE suite_execution_id = ?1 AND status = 'failed'),
                    skipped_cases = (SELECT COUNT(*) FROM case_executions
                                     WHERE suite_execution_id = ?1 AND status = 'skipped'),
                    passed_steps = (SELECT COUNT(*) FROM step_executions s
                                    JOIN case_executions c ON c.id = s.case_execution_id
                                    WHERE c.suite_execution_id = ?1 AND s.status = 'completed'),
                    failed_steps = (SELECT COUNT(*) FROM step_executions s
                                    JOIN case_executions c ON c.id = s.case_execution_id
                                    WHERE c.suite_execution_id = ?1 AND s.status = 'failed')
                 WHERE id = ?1 AND status IN {}",
                NON_TERMINAL
            ),
            [suite_id],
        )?;
        Ok(())
    }

    fn finalize_suite_if_done(conn: &Connection, suite_id: &str) -> Result<()> {
        let (total, open, failed): (i64, i64, i64) = conn.query_row(
            &format!(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status IN {} THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
                 FROM case_executions WHERE suite_execution_id = ?1",
                NON_TERMINAL
            ),
            [suite_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if total == 0 || open > 0 {
            return Ok(());
        }

        let status = if failed > 0 {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        Self::transition_suite_sync(
            conn,
            suite_id,
            &SuiteReport {
                status: Some(status),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Stop a pending or running execution.
    ///
    /// Steps, cases and the suite row move to `stopped` in one transaction,
    /// together with an audit log entry. Rows already terminal are untouched.
    pub async fn stop_execution(&self, id: &str) -> Result<StopOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT status, start_time FROM suite_executions WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status, start_time)) = current else {
            return Err(Error::NotFound(format!("execution '{}'", id)));
        };
        let status = ExecutionStatus::from_db(&status);
        if status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "Cannot stop an execution that is already {}",
                status
            )));
        }

        let end_time = Utc::now();
        let end_text = end_time.to_rfc3339();
        let duration = millis_between(parse_optional_datetime(Some(start_time)), end_time)
            .unwrap_or(0);

        let stopped_steps = tx.execute(
            &format!(
                "UPDATE step_executions SET status = 'stopped', end_time = ?1
                 WHERE case_execution_id IN (SELECT id FROM case_executions WHERE suite_execution_id = ?2)
                   AND status IN {}",
                NON_TERMINAL
            ),
            params![end_text, id],
        )?;
        let stopped_cases = tx.execute(
            &format!(
                "UPDATE case_executions SET status = 'stopped', end_time = ?1
                 WHERE suite_execution_id = ?2 AND status IN {}",
                NON_TERMINAL
            ),
            params![end_text, id],
        )?;
        tx.execute(
            &format!(
                "UPDATE suite_executions SET status = 'stopped', end_time = ?1, duration = ?2
                 WHERE id = ?3 AND status IN {}",
                NON_TERMINAL
            ),
            params![end_text, duration, id],
        )?;

        Self::insert_log(
            &tx,
            &LogScope::Suite(id.to_string()),
            &NewLogEntry::system(LogLevel::Warning, "Execution stopped by user").with_details(
                serde_json::json!({
                    "stopped_steps": stopped_steps,
                    "stopped_cases": stopped_cases,
                }),
            ),
        )?;

        tx.commit()?;

        Ok(StopOutcome {
            stopped_steps,
            stopped_cases,
            duration,
            end_time,
        })
    }

    // ========================================================================
    // Logs
    // ========================================================================

    /// Append a log entry. Returns its cursor id.
    pub async fn append_log(&self, scope: &LogScope, entry: &NewLogEntry) -> Result<i64> {
        let conn = self.conn.lock().await;
        Self::insert_log(&conn, scope, entry)
    }

    fn insert_log(conn: &Connection, scope: &LogScope, entry: &NewLogEntry) -> Result<i64> {
        let (table, kind, id) = match scope {
            LogScope::Suite(id) => ("suite_executions", "execution", id),
            LogScope::Case(id) => ("case_executions", "case execution", id),
            LogScope::Step(id) => ("step_executions", "step execution", id),
        };
        let exists = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", table),
                [id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Err(Error::NotFound(format!("{} '{}'", kind, id)));
        }

        // Parent ids come from sub-selects so suite-level tails see every entry.
        let (suite_sql, case_sql, step_sql, scope_id) = match scope {
            LogScope::Suite(id) => ("?1", "NULL", "NULL", id),
            LogScope::Case(id) => (
                "(SELECT suite_execution_id FROM case_executions WHERE id = ?1)",
                "?1",
                "NULL",
                id,
            ),
            LogScope::Step(id) => (
                "(SELECT c.suite_execution_id FROM step_executions s
                  JOIN case_executions c ON c.id = s.case_execution_id WHERE s.id = ?1)",
                "(SELECT case_execution_id FROM step_executions WHERE id = ?1)",
                "?1",
                id,
            ),
        };
        let sql = format!(
            "INSERT INTO execution_logs
             (timestamp, suite_execution_id, case_execution_id, step_execution_id, level, log_type, message, details, node_id, node_name)
             VALUES (?2, {}, {}, {}, ?3, ?4, ?5, ?6, ?7, ?8)",
            suite_sql, case_sql, step_sql
        );
        conn.execute(
            &sql,
            params![
                scope_id,
                Utc::now().to_rfc3339(),
                entry.level.as_str(),
                entry.log_type.as_str(),
                entry.message,
                json_text(entry.details.as_ref()),
                entry.node_id,
                entry.node_name,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Logs matching the filters, oldest first.
    pub async fn query_logs(&self, query: &LogQuery) -> Result<Vec<ExecutionLog>> {
        let conn = self.conn.lock().await;

        let mut sql = format!("SELECT {} FROM execution_logs WHERE 1=1", LOG_COLUMNS);
        let mut bind: Vec<SqlValue> = Vec::new();

        if let Some(id) = &query.suite_execution_id {
            sql.push_str(" AND suite_execution_id = ?");
            bind.push(SqlValue::Text(id.clone()));
        }
        if let Some(id) = &query.case_execution_id {
            sql.push_str(" AND case_execution_id = ?");
            bind.push(SqlValue::Text(id.clone()));
        }
        if let Some(id) = &query.step_execution_id {
            sql.push_str(" AND step_execution_id = ?");
            bind.push(SqlValue::Text(id.clone()));
        }
        if let Some(level) = &query.level {
            sql.push_str(" AND level = ?");
            bind.push(SqlValue::Text(level.as_str().to_string()));
        }

        let limit = if query.limit == 0 {
            DEFAULT_LOG_LIMIT
        } else {
            query.limit
        };
        sql.push_str(" ORDER BY id ASC LIMIT ?");
        bind.push(SqlValue::Integer(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params_from_iter(bind.iter()), Self::row_to_log)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    /// Suite-level logs with an id greater than `cursor`, oldest first.
    pub async fn list_logs_after(
        &self,
        suite_execution_id: &str,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<ExecutionLog>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM execution_logs
             WHERE suite_execution_id = ?1 AND id > ?2
             ORDER BY id ASC LIMIT ?3",
            LOG_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(
                params![suite_execution_id, cursor, limit as i64],
                Self::row_to_log,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    // ========================================================================
    // History
    // ========================================================================

    /// One page of executions, newest first, with scope-wide stats.
    pub async fn query_executions(&self, query: &ExecutionListQuery) -> Result<ExecutionPage> {
        let conn = self.conn.lock().await;
        let (page, page_size) = query.normalized();

        let mut scope = String::from(" WHERE 1=1");
        let mut scope_bind: Vec<SqlValue> = Vec::new();
        if let Some(suite_id) = &query.suite_id {
            scope.push_str(" AND suite_id = ?");
            scope_bind.push(SqlValue::Text(suite_id.clone()));
        }

        let stats_sql = format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'stopped' THEN 1 ELSE 0 END), 0)
             FROM suite_executions{}",
            scope
        );
        let stats = conn.query_row(&stats_sql, params_from_iter(scope_bind.iter()), |row| {
            Ok(ExecutionStats {
                total: row.get::<_, i64>(0)?.max(0) as usize,
                completed: row.get::<_, i64>(1)?.max(0) as usize,
                failed: row.get::<_, i64>(2)?.max(0) as usize,
                stopped: row.get::<_, i64>(3)?.max(0) as usize,
            })
        })?;

        let mut filtered = scope;
        let mut bind = scope_bind;
        if let Some(status) = &query.status {
            filtered.push_str(" AND status = ?");
            bind.push(SqlValue::Text(status.as_str().to_string()));
        }

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM suite_executions{}", filtered),
            params_from_iter(bind.iter()),
            |row| row.get(0),
        )?;
        let total = total.max(0) as usize;

        let list_sql = format!(
            "SELECT {} FROM suite_executions{} ORDER BY start_time DESC, id LIMIT ? OFFSET ?",
            SUITE_EXECUTION_COLUMNS, filtered
        );
        bind.push(SqlValue::Integer(page_size as i64));
        bind.push(SqlValue::Integer((page - 1).saturating_mul(page_size) as i64));

        let mut stmt = conn.prepare(&list_sql)?;
        let executions = stmt
            .query_map(params_from_iter(bind.iter()), Self::row_to_suite_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|execution| ExecutionListItem {
                pass_rate: execution.pass_rate(),
                execution,
            })
            .collect();

        Ok(ExecutionPage {
            executions,
            pagination: Pagination {
                page,
                page_size,
                total,
                total_pages: total.div_ceil(page_size),
            },
            stats,
        })
    }

    pub async fn check_health(&self) -> Result<DatabaseHealth> {
        let conn = self.conn.lock().await;

        let foreign_keys_enabled: i64 =
            conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let integrity_check: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let busy_timeout_ms: i64 = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;

        let mut violations_stmt = conn.prepare("PRAGMA foreign_key_check")?;
        let foreign_key_violations = violations_stmt
            .query_map([], |row| {
                let table: String = row.get(0)?;
                let rowid: Option<i64> = row.get(1)?;
                let parent: String = row.get(2)?;
                Ok(format!(
                    "table={} rowid={} parent={}",
                    table,
                    rowid
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    parent
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let orphaned_case_executions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM case_executions c
             LEFT JOIN suite_executions s ON s.id = c.suite_execution_id
             WHERE s.id IS NULL",
            [],
            |row| row.get(0),
        )?;
        let orphaned_step_executions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM step_executions s
             LEFT JOIN case_executions c ON c.id = s.case_execution_id
             WHERE c.id IS NULL",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseHealth {
            foreign_keys_enabled: foreign_keys_enabled == 1,
            integrity_check,
            foreign_key_violations,
            orphaned_case_executions: orphaned_case_executions.max(0) as u64,
            orphaned_step_executions: orphaned_step_executions.max(0) as u64,
            journal_mode,
            busy_timeout_ms,
        })
    }

    // ========================================================================
    // Row mapping
    // ========================================================================

    fn row_to_suite_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<SuiteExecution> {
        let status: String = row.get(3)?;
        Ok(SuiteExecution {
            id: row.get(0)?,
            suite_id: row.get(1)?,
            suite_name: row.get(2)?,
            status: ExecutionStatus::from_db(&status),
            start_time: parse_datetime_utc(&row.get::<_, String>(4)?)?,
            end_time: parse_optional_datetime(row.get(5)?),
            duration: row.get(6)?,
            environment_snapshot: parse_json_lenient(row.get(7)?),
            total_cases: row.get(8)?,
            passed_cases: row.get(9)?,
            failed_cases: row.get(10)?,
            skipped_cases: row.get(11)?,
            total_steps: row.get(12)?,
            passed_steps: row.get(13)?,
            failed_steps: row.get(14)?,
            triggered_by: row.get(15)?,
            error_message: row.get(16)?,
        })
    }

    fn row_to_case_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<CaseExecution> {
        let status: String = row.get(5)?;
        Ok(CaseExecution {
            id: row.get(0)?,
            suite_execution_id: row.get(1)?,
            test_case_id: row.get(2)?,
            test_case_name: row.get(3)?,
            order: row.get(4)?,
            status: ExecutionStatus::from_db(&status),
            start_time: parse_optional_datetime(row.get(6)?),
            end_time: parse_optional_datetime(row.get(7)?),
            duration: row.get(8)?,
            total_steps: row.get(9)?,
            passed_steps: row.get(10)?,
            failed_steps: row.get(11)?,
            error_message: row.get(12)?,
            steps: Vec::new(),
        })
    }

    fn row_to_step_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepExecution> {
        let status: String = row.get(6)?;
        Ok(StepExecution {
            id: row.get(0)?,
            case_execution_id: row.get(1)?,
            node_id: row.get(2)?,
            node_name: row.get(3)?,
            node_type: row.get(4)?,
            order: row.get(5)?,
            status: ExecutionStatus::from_db(&status),
            start_time: parse_optional_datetime(row.get(7)?),
            end_time: parse_optional_datetime(row.get(8)?),
            duration: row.get(9)?,
            node_snapshot: parse_json_lenient(row.get(10)?),
            request_url: row.get(11)?,
            request_method: row.get(12)?,
            request_headers: parse_json_lenient(row.get(13)?),
            request_body: parse_json_lenient(row.get(14)?),
            request_params: parse_json_lenient(row.get(15)?),
            response_status: row.get(16)?,
            response_headers: parse_json_lenient(row.get(17)?),
            response_body: parse_json_lenient(row.get(18)?),
            assertion_results: parse_json_lenient(row.get(19)?),
            extracted_variables: parse_json_lenient(row.get(20)?),
            error_message: row.get(21)?,
        })
    }

    fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionLog> {
        let level: String = row.get(5)?;
        let log_type: String = row.get(6)?;
        Ok(ExecutionLog {
            id: row.get(0)?,
            timestamp: parse_datetime_utc(&row.get::<_, String>(1)?)?,
            suite_execution_id: row.get(2)?,
            case_execution_id: row.get(3)?,
            step_execution_id: row.get(4)?,
            level: LogLevel::from_db(&level),
            log_type: LogType::from_db(&log_type),
            message: row.get(7)?,
            details: parse_json_lenient(row.get(8)?),
            node_id: row.get(9)?,
            node_name: row.get(10)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::flow::parse_flow;

    /// Flow with `steps` api nodes chained after start.
    pub(crate) fn chain_flow(steps: usize) -> FlowConfig {
        let mut nodes = vec![serde_json::json!({"type": "start", "id": "start"})];
        let mut edges = Vec::new();
        let mut prev = "start".to_string();
        for i in 1..=steps {
            let id = format!("step_{}", i);
            nodes.push(serde_json::json!({
                "type": "api",
                "id": id,
                "data": {"apiId": format!("api-{}", i), "method": "GET", "url": format!("/r/{}", i)}
            }));
            edges.push(serde_json::json!({"source": prev, "target": id}));
            prev = id;
        }
        let doc = serde_json::json!({"nodes": nodes, "edges": edges});
        parse_flow(&doc.to_string()).unwrap()
    }

    /// Suite `suite-1` with `cases` enabled cases of `steps` steps each.
    pub(crate) async fn seed_suite(storage: &SqliteStorage, cases: usize, steps: usize) {
        let mut entries = Vec::new();
        for i in 1..=cases {
            let case_id = format!("case-{}", i);
            storage
                .save_test_case(&case_id, &format!("Case {}", i), None, &chain_flow(steps))
                .await
                .unwrap();
            entries.push(SuiteCaseEntry {
                test_case_id: case_id,
                order: i as i64,
                enabled: true,
            });
        }
        storage
            .save_suite(&TestSuite {
                id: "suite-1".into(),
                name: "Smoke".into(),
                description: None,
                use_global_settings: true,
                environment_config: None,
                test_cases: entries,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn create_run(storage: &SqliteStorage, cases: usize, steps: usize) -> CreatedHierarchy {
        seed_suite(storage, cases, steps).await;
        let planned = storage.get_enabled_cases("suite-1").await.unwrap();
        storage
            .create_hierarchy(&HierarchyPlan {
                suite_id: "suite-1".into(),
                suite_name: "Smoke".into(),
                environment_snapshot: r#"{"source":"global","config":{}}"#.into(),
                triggered_by: "manual".into(),
                cases: planned,
            })
            .await
            .unwrap()
    }

    fn status(s: ExecutionStatus) -> StepReport {
        StepReport {
            status: Some(s),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_test_case_regenerates_steps() {
        let storage = SqliteStorage::open_in_memory().unwrap();

        let saved = storage
            .save_test_case("tc-1", "Login", Some("login flow"), &chain_flow(3))
            .await
            .unwrap();
        assert_eq!(saved.steps.len(), 3);

        storage
            .save_test_case("tc-1", "Login", None, &chain_flow(2))
            .await
            .unwrap();
        let loaded = storage.get_test_case("tc-1").await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].node_id, "step_1");
        assert_eq!(loaded.steps[1].order, 1);
        assert_eq!(loaded.steps[0].step_type, NodeKind::Api);
        assert!(loaded.flow_config.is_some());
    }

    #[tokio::test]
    async fn test_invalid_flow_is_not_saved() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut flow = chain_flow(2);
        flow.edges.push(crate::flow::FlowEdge::new("step_2", "step_1"));

        let err = storage
            .save_test_case("tc-bad", "Bad", None, &flow)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(storage.get_test_case("tc-bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_suite_with_unknown_case_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let err = storage
            .save_suite(&TestSuite {
                id: "s".into(),
                name: "S".into(),
                description: None,
                use_global_settings: true,
                environment_config: None,
                test_cases: vec![SuiteCaseEntry {
                    test_case_id: "missing".into(),
                    order: 0,
                    enabled: true,
                }],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_enabled_cases_in_suite_order() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_suite(&storage, 3, 1).await;

        let mut suite = storage.get_suite("suite-1").await.unwrap().unwrap();
        suite.test_cases[0].order = 10;
        suite.test_cases[1].enabled = false;
        storage.save_suite(&suite).await.unwrap();

        let cases = storage.get_enabled_cases("suite-1").await.unwrap();
        let ids: Vec<&str> = cases.iter().map(|c| c.test_case_id.as_str()).collect();
        assert_eq!(ids, vec!["case-3", "case-1"]);
    }

    #[tokio::test]
    async fn test_create_hierarchy_prepopulates_pending_rows() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = create_run(&storage, 2, 3).await;
        assert_eq!(created.total_cases, 2);
        assert_eq!(created.total_steps, 6);

        let hierarchy = storage
            .get_hierarchy(&created.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hierarchy.execution.status, ExecutionStatus::Pending);
        assert_eq!(hierarchy.cases.len(), 2);
        for case in &hierarchy.cases {
            assert_eq!(case.status, ExecutionStatus::Pending);
            assert_eq!(case.steps.len(), 3);
            assert!(case
                .steps
                .iter()
                .all(|s| s.status == ExecutionStatus::Pending));
        }
    }

    #[tokio::test]
    async fn test_mark_running_only_from_pending() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = create_run(&storage, 1, 1).await;
        let id = &created.execution_id;

        let done = SuiteReport {
            status: Some(ExecutionStatus::Completed),
            ..Default::default()
        };
        assert!(storage.transition_suite(id, &done).await.unwrap());
        assert!(!storage.mark_suite_running(id).await.unwrap());

        let execution = storage.get_execution(id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.end_time.is_some());
        assert!(execution.duration.is_some());

        let failed = SuiteReport {
            status: Some(ExecutionStatus::Failed),
            ..Default::default()
        };
        assert!(!storage.transition_suite(id, &failed).await.unwrap());
    }

    #[tokio::test]
    async fn test_step_reports_roll_up_to_suite() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = create_run(&storage, 2, 2).await;
        let id = created.execution_id.clone();
        storage.mark_suite_running(&id).await.unwrap();

        for case in &created.cases {
            for step in &case.steps {
                storage
                    .report_step(&step.step_execution_id, &status(ExecutionStatus::Running))
                    .await
                    .unwrap();
                storage
                    .report_step(&step.step_execution_id, &status(ExecutionStatus::Completed))
                    .await
                    .unwrap();
            }
        }
        let mid = storage.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(mid.passed_steps, 4);
        assert_eq!(mid.status, ExecutionStatus::Running);

        let completed = CaseReport {
            status: Some(ExecutionStatus::Completed),
            ..Default::default()
        };
        let failed = CaseReport {
            status: Some(ExecutionStatus::Failed),
            ..Default::default()
        };
        storage
            .report_case(&created.cases[0].case_execution_id, &completed)
            .await
            .unwrap();
        assert_eq!(
            storage.get_execution(&id).await.unwrap().unwrap().status,
            ExecutionStatus::Running
        );
        storage
            .report_case(&created.cases[1].case_execution_id, &failed)
            .await
            .unwrap();

        let hierarchy = storage.get_hierarchy(&id).await.unwrap().unwrap();
        assert_eq!(hierarchy.execution.status, ExecutionStatus::Failed);
        assert_eq!(hierarchy.execution.passed_cases, 1);
        assert_eq!(hierarchy.execution.failed_cases, 1);
        assert_eq!(hierarchy.cases[0].passed_steps, 2);
        assert!(hierarchy.cases[0].start_time.is_some());
    }

    #[tokio::test]
    async fn test_terminal_step_is_immutable_and_captures_write_once() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = create_run(&storage, 1, 1).await;
        let step_id = created.cases[0].steps[0].step_execution_id.clone();

        let first = StepReport {
            status: Some(ExecutionStatus::Running),
            request_url: Some("https://a.example/r/1".into()),
            ..Default::default()
        };
        assert!(storage.report_step(&step_id, &first).await.unwrap());

        let second = StepReport {
            status: Some(ExecutionStatus::Completed),
            request_url: Some("https://other.example".into()),
            response_body: Some(serde_json::json!({"ok": true})),
            ..Default::default()
        };
        assert!(storage.report_step(&step_id, &second).await.unwrap());

        let late = StepReport {
            status: Some(ExecutionStatus::Failed),
            error_message: Some("late".into()),
            ..Default::default()
        };
        assert!(!storage.report_step(&step_id, &late).await.unwrap());

        let step = storage.get_step_execution(&step_id).await.unwrap().unwrap();
        assert_eq!(step.status, ExecutionStatus::Completed);
        assert_eq!(step.request_url.as_deref(), Some("https://a.example/r/1"));
        assert_eq!(step.response_body, Some(serde_json::json!({"ok": true})));
        assert!(step.error_message.is_none());
        assert!(step.duration.is_some());
    }

    #[tokio::test]
    async fn test_stop_marks_only_open_rows() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = create_run(&storage, 2, 3).await;
        let id = created.execution_id.clone();
        storage.mark_suite_running(&id).await.unwrap();

        // Case 1 finished, case 2 at step 2.
        for step in &created.cases[0].steps {
            storage
                .report_step(&step.step_execution_id, &status(ExecutionStatus::Completed))
                .await
                .unwrap();
        }
        storage
            .report_case(
                &created.cases[0].case_execution_id,
                &CaseReport {
                    status: Some(ExecutionStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let case_2 = &created.cases[1];
        storage
            .report_step(&case_2.steps[0].step_execution_id, &status(ExecutionStatus::Completed))
            .await
            .unwrap();
        storage
            .report_step(&case_2.steps[1].step_execution_id, &status(ExecutionStatus::Running))
            .await
            .unwrap();

        let outcome = storage.stop_execution(&id).await.unwrap();
        assert_eq!(outcome.stopped_steps, 2);
        assert_eq!(outcome.stopped_cases, 1);

        let hierarchy = storage.get_hierarchy(&id).await.unwrap().unwrap();
        assert_eq!(hierarchy.execution.status, ExecutionStatus::Stopped);
        let end = hierarchy.execution.end_time.unwrap();
        assert_eq!(
            hierarchy.execution.duration,
            Some((end - hierarchy.execution.start_time).num_milliseconds())
        );
        assert_eq!(hierarchy.cases[0].status, ExecutionStatus::Completed);
        assert_eq!(hierarchy.cases[1].status, ExecutionStatus::Stopped);
        assert!(hierarchy.cases[1].end_time.is_some());
        assert_eq!(hierarchy.cases[1].steps[0].status, ExecutionStatus::Completed);
        assert_eq!(hierarchy.cases[1].steps[1].status, ExecutionStatus::Stopped);
        assert_eq!(hierarchy.cases[1].steps[2].status, ExecutionStatus::Stopped);

        let err = storage.stop_execution(&id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let logs = storage
            .query_logs(&LogQuery {
                suite_execution_id: Some(id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Warning);
    }

    #[tokio::test]
    async fn test_stop_missing_execution() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert!(matches!(
            storage.stop_execution("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_logs_inherit_parent_ids_and_tail_by_cursor() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = create_run(&storage, 1, 1).await;
        let id = created.execution_id.clone();
        let case_id = created.cases[0].case_execution_id.clone();
        let step_id = created.cases[0].steps[0].step_execution_id.clone();

        let first = storage
            .append_log(
                &LogScope::Suite(id.clone()),
                &NewLogEntry::system(LogLevel::Info, "dispatched"),
            )
            .await
            .unwrap();
        storage
            .append_log(
                &LogScope::Case(case_id.clone()),
                &NewLogEntry::system(LogLevel::Info, "case started"),
            )
            .await
            .unwrap();
        storage
            .append_log(
                &LogScope::Step(step_id.clone()),
                &NewLogEntry {
                    level: LogLevel::Error,
                    log_type: LogType::Assertion,
                    message: "status mismatch".into(),
                    details: Some(serde_json::json!({"expected": 200, "actual": 500})),
                    node_id: Some("step_1".into()),
                    node_name: Some("step_1".into()),
                },
            )
            .await
            .unwrap();

        let tail = storage.list_logs_after(&id, first, 100).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].case_execution_id.as_deref(), Some(case_id.as_str()));
        assert_eq!(tail[1].suite_execution_id.as_deref(), Some(id.as_str()));
        assert_eq!(tail[1].case_execution_id.as_deref(), Some(case_id.as_str()));
        assert_eq!(tail[1].log_type, LogType::Assertion);
        assert!(tail[0].id < tail[1].id);

        let errors = storage
            .query_logs(&LogQuery {
                suite_execution_id: Some(id.clone()),
                level: Some(LogLevel::Error),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].details.as_ref().unwrap()["actual"], 500);

        let limited = storage
            .query_logs(&LogQuery {
                suite_execution_id: Some(id),
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_log_for_unknown_scope_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        create_run(&storage, 1, 1).await;
        let entry = NewLogEntry::system(LogLevel::Info, "lost");

        for scope in [
            LogScope::Suite("ghost".into()),
            LogScope::Case("ghost".into()),
            LogScope::Step("ghost".into()),
        ] {
            assert!(matches!(
                storage.append_log(&scope, &entry).await,
                Err(Error::NotFound(_))
            ));
        }

        let conn = storage.conn.lock().await;
        let orphaned: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM execution_logs WHERE suite_execution_id IS NULL OR message = 'lost'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphaned, 0);
    }

    #[tokio::test]
    async fn test_corrupt_json_reads_as_null() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = create_run(&storage, 1, 1).await;
        {
            let conn = storage.conn.lock().await;
            conn.execute(
                "UPDATE suite_executions SET environment_snapshot = '{not json' WHERE id = ?1",
                [created.execution_id.as_str()],
            )
            .unwrap();
            conn.execute(
                "UPDATE step_executions SET response_body = '[broken'",
                [],
            )
            .unwrap();
        }
        let hierarchy = storage
            .get_hierarchy(&created.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert!(hierarchy.execution.environment_snapshot.is_none());
        assert!(hierarchy.cases[0].steps[0].response_body.is_none());

        let origin = storage
            .get_execution_origin(&created.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(origin.environment_snapshot.as_deref(), Some("{not json"));
    }

    #[tokio::test]
    async fn test_query_executions_pagination_and_stats() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_suite(&storage, 1, 1).await;
        let planned = storage.get_enabled_cases("suite-1").await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let created = storage
                .create_hierarchy(&HierarchyPlan {
                    suite_id: "suite-1".into(),
                    suite_name: "Smoke".into(),
                    environment_snapshot: "{}".into(),
                    triggered_by: "manual".into(),
                    cases: planned.clone(),
                })
                .await
                .unwrap();
            ids.push(created);
        }
        // Two completed through their only case, one stopped, two pending.
        for created in &ids[..2] {
            storage
                .report_case(
                    &created.cases[0].case_execution_id,
                    &CaseReport {
                        status: Some(ExecutionStatus::Completed),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        storage.stop_execution(&ids[2].execution_id).await.unwrap();

        let page = storage
            .query_executions(&ExecutionListQuery {
                suite_id: Some("suite-1".into()),
                status: Some(ExecutionStatus::Completed),
                page: 1,
                page_size: 1,
            })
            .await
            .unwrap();
        assert_eq!(page.executions.len(), 1);
        assert_eq!(page.executions[0].pass_rate, 100);
        assert_eq!(page.pagination.total, 2);
        assert_eq!(page.pagination.total_pages, 2);
        assert_eq!(page.stats.total, 5);
        assert_eq!(page.stats.completed, 2);
        assert_eq!(page.stats.stopped, 1);
        assert_eq!(page.stats.failed, 0);

        let other = storage
            .query_executions(&ExecutionListQuery {
                suite_id: Some("other".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(other.stats.total, 0);
        assert_eq!(other.pagination.total_pages, 0);

        let beyond = storage
            .query_executions(&ExecutionListQuery {
                page: usize::MAX,
                page_size: MAX_PAGE_SIZE,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(beyond.executions.is_empty());
        assert_eq!(beyond.pagination.total, 5);
    }

    #[tokio::test]
    async fn test_settings_roundtrip_and_health() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.get_settings().await.unwrap().is_none());
        storage
            .save_settings(&serde_json::json!({"baseUrl": "https://a.example"}))
            .await
            .unwrap();
        assert_eq!(
            storage.get_settings().await.unwrap().unwrap()["baseUrl"],
            "https://a.example"
        );

        let health = storage.check_health().await.unwrap();
        assert!(health.foreign_keys_enabled);
        assert_eq!(health.integrity_check, "ok");
        assert_eq!(health.orphaned_step_executions, 0);
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowcheck.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            seed_suite(&storage, 1, 2).await;
        }
        let storage = SqliteStorage::open(&path).unwrap();
        let suite = storage.get_suite("suite-1").await.unwrap().unwrap();
        assert_eq!(suite.test_cases.len(), 1);
    }
}
