//! Execution lifecycle: dispatch, stop, retry and worker result reporting.
//!
//! A suite execution moves `pending -> running -> {completed | failed | stopped}`.
//! Two writers act on the same rows, this controller and the external worker,
//! so every transition is a conditional update on the current status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::worker::{DispatchPayload, ExecutionWorker};
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{
    CaseReport, EnvironmentSnapshot, ExecutionStatus, HierarchyPlan, LogLevel, LogScope, LogType,
    NewLogEntry, PlannedCase, SnapshotSource, SqliteStorage, StepReport, SuiteReport,
};

/// Returned by dispatch and retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub execution_id: String,
    pub suite_id: String,
    pub suite_name: String,
    pub total_cases: i64,
    pub total_steps: i64,
    /// False when the worker could not take the execution; it is then failed.
    pub dispatched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
}

/// Returned by stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReceipt {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub stopped_steps: usize,
    pub stopped_cases: usize,
    pub duration: i64,
    pub end_time: DateTime<Utc>,
    /// Whether the worker acknowledged the cancel signal.
    pub worker_notified: bool,
}

/// Everything needed to create one execution and hand it over.
struct Launch<'a> {
    suite_id: &'a str,
    suite_name: &'a str,
    snapshot: String,
    triggered_by: &'a str,
    cases: Vec<PlannedCase>,
    retry_of: Option<&'a str>,
}

/// Drives suite executions through their states.
#[derive(Clone)]
pub struct LifecycleController {
    storage: SqliteStorage,
    worker: Arc<dyn ExecutionWorker>,
}

impl LifecycleController {
    pub fn new(storage: SqliteStorage, worker: Arc<dyn ExecutionWorker>) -> Self {
        Self { storage, worker }
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Create an execution of a suite and hand it to the worker.
    ///
    /// The environment is snapshotted here, once. A worker failure does not
    /// fail the call: the execution is marked failed and the receipt says so.
    pub async fn dispatch(&self, suite_id: &str, triggered_by: &str) -> Result<DispatchReceipt> {
        let suite = self
            .storage
            .get_suite(suite_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("test suite '{}'", suite_id)))?;

        let cases = self.storage.get_enabled_cases(&suite.id).await?;
        if cases.is_empty() {
            return Err(Error::InvalidState(format!(
                "Suite '{}' has no enabled test cases",
                suite.name
            )));
        }

        let (source, config) = if suite.use_global_settings {
            let settings = self.storage.get_settings().await?;
            (SnapshotSource::Global, settings.unwrap_or_else(|| json!({})))
        } else {
            (
                SnapshotSource::Suite,
                suite.environment_config.clone().unwrap_or_else(|| json!({})),
            )
        };
        let snapshot = serde_json::to_string(&EnvironmentSnapshot {
            source,
            snapshot_time: Utc::now(),
            config,
        })?;

        self.launch(Launch {
            suite_id: &suite.id,
            suite_name: &suite.name,
            snapshot,
            triggered_by,
            cases,
            retry_of: None,
        })
        .await
    }

    /// Run a suite again with the environment snapshot of an earlier execution.
    ///
    /// The new execution is independent; only a log line names the original.
    pub async fn retry(&self, execution_id: &str, triggered_by: &str) -> Result<DispatchReceipt> {
        let origin = self
            .storage
            .get_execution_origin(execution_id)
            .await?
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "Cannot retry execution '{}': it does not exist",
                    execution_id
                ))
            })?;

        let suite_name = match self.storage.get_suite(&origin.suite_id).await? {
            Some(suite) => suite.name,
            None => origin.suite_name.clone(),
        };
        let cases = self.storage.get_enabled_cases(&origin.suite_id).await?;
        if cases.is_empty() {
            return Err(Error::InvalidState(format!(
                "Suite '{}' has no enabled test cases",
                suite_name
            )));
        }

        let receipt = self
            .launch(Launch {
                suite_id: &origin.suite_id,
                suite_name: &suite_name,
                snapshot: origin
                    .environment_snapshot
                    .unwrap_or_else(|| "{}".to_string()),
                triggered_by,
                cases,
                retry_of: Some(execution_id),
            })
            .await?;

        metrics::record_retry();
        Ok(receipt)
    }

    async fn launch(&self, launch: Launch<'_>) -> Result<DispatchReceipt> {
        let created = self
            .storage
            .create_hierarchy(&HierarchyPlan {
                suite_id: launch.suite_id.to_string(),
                suite_name: launch.suite_name.to_string(),
                environment_snapshot: launch.snapshot.clone(),
                triggered_by: launch.triggered_by.to_string(),
                cases: launch.cases,
            })
            .await?;
        let execution_id = created.execution_id.clone();
        let scope = LogScope::Suite(execution_id.clone());

        info!(
            execution_id = %execution_id,
            suite_id = %launch.suite_id,
            total_cases = created.total_cases,
            total_steps = created.total_steps,
            "Execution created"
        );
        self.storage
            .append_log(
                &scope,
                &NewLogEntry::system(
                    LogLevel::Info,
                    format!("Execution of suite '{}' created", launch.suite_name),
                )
                .with_details(json!({
                    "total_cases": created.total_cases,
                    "total_steps": created.total_steps,
                    "triggered_by": launch.triggered_by,
                })),
            )
            .await?;

        if let Some(original) = launch.retry_of {
            self.storage
                .append_log(
                    &scope,
                    &NewLogEntry::system(
                        LogLevel::Info,
                        format!("Retry of execution {}", original),
                    )
                    .with_details(json!({ "original_execution_id": original })),
                )
                .await?;
        }

        let environment_config = serde_json::from_str::<Value>(&launch.snapshot)
            .ok()
            .and_then(|snapshot| snapshot.get("config").cloned())
            .unwrap_or_else(|| json!({}));
        let payload = DispatchPayload {
            suite_execution_id: execution_id.clone(),
            suite_id: launch.suite_id.to_string(),
            environment_config,
            cases: created.cases,
        };

        let dispatched = match self.worker.dispatch(&payload).await {
            Ok(()) => {
                // The worker may already have finished; pending is the only
                // state this update may leave.
                if self.storage.mark_suite_running(&execution_id).await? {
                    self.storage
                        .append_log(
                            &scope,
                            &NewLogEntry::system(LogLevel::Info, "Execution dispatched to worker"),
                        )
                        .await?;
                } else {
                    debug!(execution_id = %execution_id, "Execution left pending before dispatch returned");
                }
                metrics::record_dispatch("dispatched");
                true
            }
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Dispatch failed");
                let message = format!("Failed to dispatch execution: {}", e);
                self.storage
                    .transition_suite(
                        &execution_id,
                        &SuiteReport {
                            status: Some(ExecutionStatus::Failed),
                            error_message: Some(message.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.storage
                    .append_log(
                        &scope,
                        &NewLogEntry {
                            level: LogLevel::Error,
                            log_type: LogType::Error,
                            message,
                            details: None,
                            node_id: None,
                            node_name: None,
                        },
                    )
                    .await?;
                metrics::record_dispatch("failed");
                false
            }
        };

        Ok(DispatchReceipt {
            execution_id,
            suite_id: launch.suite_id.to_string(),
            suite_name: launch.suite_name.to_string(),
            total_cases: created.total_cases,
            total_steps: created.total_steps,
            dispatched,
            retry_of: launch.retry_of.map(str::to_string),
        })
    }

    /// Stop a pending or running execution.
    ///
    /// Persisted state is authoritative; the worker cancel is best-effort.
    pub async fn stop(&self, execution_id: &str) -> Result<StopReceipt> {
        let outcome = self.storage.stop_execution(execution_id).await?;
        info!(
            execution_id = %execution_id,
            stopped_steps = outcome.stopped_steps,
            stopped_cases = outcome.stopped_cases,
            "Execution stopped"
        );

        let worker_notified = match self.worker.cancel(execution_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Worker did not acknowledge cancel");
                false
            }
        };
        metrics::record_stop(worker_notified);

        Ok(StopReceipt {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Stopped,
            stopped_steps: outcome.stopped_steps,
            stopped_cases: outcome.stopped_cases,
            duration: outcome.duration,
            end_time: outcome.end_time,
            worker_notified,
        })
    }

    // ========================================================================
    // Worker reports
    // ========================================================================

    /// Returns false if the step was already terminal.
    pub async fn report_step(&self, step_execution_id: &str, report: &StepReport) -> Result<bool> {
        let applied = self.storage.report_step(step_execution_id, report).await?;
        metrics::record_worker_report("step", status_label(report.status));
        Ok(applied)
    }

    pub async fn report_case(&self, case_execution_id: &str, report: &CaseReport) -> Result<bool> {
        let applied = self.storage.report_case(case_execution_id, report).await?;
        metrics::record_worker_report("case", status_label(report.status));
        Ok(applied)
    }

    pub async fn report_suite(&self, execution_id: &str, report: &SuiteReport) -> Result<bool> {
        let applied = self.storage.transition_suite(execution_id, report).await?;
        metrics::record_worker_report("suite", status_label(report.status));
        if applied {
            info!(execution_id = %execution_id, status = ?report.status, "Suite result reported");
        }
        Ok(applied)
    }

    pub async fn append_log(&self, scope: &LogScope, entry: &NewLogEntry) -> Result<i64> {
        self.storage.append_log(scope, entry).await
    }
}

fn status_label(status: Option<ExecutionStatus>) -> &'static str {
    status.map(|s| s.as_str()).unwrap_or("none")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LogQuery;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Accepts everything and remembers what it was sent.
    #[derive(Default)]
    struct RecordingWorker {
        dispatched: Mutex<Vec<DispatchPayload>>,
        cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExecutionWorker for RecordingWorker {
        async fn dispatch(&self, payload: &DispatchPayload) -> Result<()> {
            self.dispatched.lock().await.push(payload.clone());
            Ok(())
        }

        async fn cancel(&self, execution_id: &str) -> Result<()> {
            self.cancelled.lock().await.push(execution_id.to_string());
            Ok(())
        }
    }

    struct DownWorker;

    #[async_trait]
    impl ExecutionWorker for DownWorker {
        async fn dispatch(&self, _payload: &DispatchPayload) -> Result<()> {
            Err(Error::Dispatch("connection refused".into()))
        }

        async fn cancel(&self, _execution_id: &str) -> Result<()> {
            Err(Error::Dispatch("connection refused".into()))
        }
    }

    /// Finishes the whole execution before dispatch returns.
    struct EagerWorker {
        storage: SqliteStorage,
    }

    #[async_trait]
    impl ExecutionWorker for EagerWorker {
        async fn dispatch(&self, payload: &DispatchPayload) -> Result<()> {
            self.storage
                .transition_suite(
                    &payload.suite_execution_id,
                    &SuiteReport {
                        status: Some(ExecutionStatus::Completed),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(())
        }

        async fn cancel(&self, _execution_id: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn seeded_storage(use_global_settings: bool) -> SqliteStorage {
        let storage = SqliteStorage::open_in_memory().unwrap();
        crate::storage::sqlite::tests::seed_suite(&storage, 2, 3).await;
        if !use_global_settings {
            let mut suite = storage.get_suite("suite-1").await.unwrap().unwrap();
            suite.use_global_settings = false;
            suite.environment_config = Some(json!({"baseUrl": "https://suite.example"}));
            storage.save_suite(&suite).await.unwrap();
        }
        storage
            .save_settings(&json!({"baseUrl": "https://a.example"}))
            .await
            .unwrap();
        storage
    }

    async fn suite_logs(storage: &SqliteStorage, execution_id: &str) -> Vec<String> {
        storage
            .query_logs(&LogQuery {
                suite_execution_id: Some(execution_id.to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.message)
            .collect()
    }

    #[tokio::test]
    async fn test_dispatch_creates_hierarchy_and_runs() {
        let storage = seeded_storage(true).await;
        let worker = Arc::new(RecordingWorker::default());
        let controller = LifecycleController::new(storage.clone(), worker.clone());

        let receipt = controller.dispatch("suite-1", "manual").await.unwrap();
        assert!(receipt.dispatched);
        assert_eq!(receipt.total_cases, 2);
        assert_eq!(receipt.total_steps, 6);
        assert_eq!(receipt.suite_name, "Smoke");

        let execution = storage
            .get_execution(&receipt.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
        let snapshot = execution.environment_snapshot.unwrap();
        assert_eq!(snapshot["source"], "global");
        assert_eq!(snapshot["config"]["baseUrl"], "https://a.example");

        let dispatched = worker.dispatched.lock().await;
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].suite_execution_id, receipt.execution_id);
        assert_eq!(
            dispatched[0].environment_config["baseUrl"],
            "https://a.example"
        );
        assert_eq!(dispatched[0].cases.len(), 2);
        assert_eq!(dispatched[0].cases[1].steps.len(), 3);
    }

    #[tokio::test]
    async fn test_dispatch_uses_suite_environment() {
        let storage = seeded_storage(false).await;
        let controller =
            LifecycleController::new(storage.clone(), Arc::new(RecordingWorker::default()));

        let receipt = controller.dispatch("suite-1", "manual").await.unwrap();
        let execution = storage
            .get_execution(&receipt.execution_id)
            .await
            .unwrap()
            .unwrap();
        let snapshot = execution.environment_snapshot.unwrap();
        assert_eq!(snapshot["source"], "suite");
        assert_eq!(snapshot["config"]["baseUrl"], "https://suite.example");
    }

    #[tokio::test]
    async fn test_dispatch_rejects_missing_and_empty_suites() {
        let storage = seeded_storage(true).await;
        let controller =
            LifecycleController::new(storage.clone(), Arc::new(RecordingWorker::default()));

        assert!(matches!(
            controller.dispatch("nope", "manual").await,
            Err(Error::NotFound(_))
        ));

        let mut suite = storage.get_suite("suite-1").await.unwrap().unwrap();
        for entry in &mut suite.test_cases {
            entry.enabled = false;
        }
        storage.save_suite(&suite).await.unwrap();
        assert!(matches!(
            controller.dispatch("suite-1", "manual").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_execution_failed() {
        let storage = seeded_storage(true).await;
        let controller = LifecycleController::new(storage.clone(), Arc::new(DownWorker));

        let receipt = controller.dispatch("suite-1", "manual").await.unwrap();
        assert!(!receipt.dispatched);

        let execution = storage
            .get_execution(&receipt.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution
            .error_message
            .unwrap()
            .contains("connection refused"));
        assert!(execution.end_time.is_some());

        let errors = storage
            .query_logs(&LogQuery {
                suite_execution_id: Some(receipt.execution_id.clone()),
                level: Some(LogLevel::Error),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].log_type, LogType::Error);
    }

    #[tokio::test]
    async fn test_worker_completion_during_dispatch_is_kept() {
        let storage = seeded_storage(true).await;
        let controller = LifecycleController::new(
            storage.clone(),
            Arc::new(EagerWorker {
                storage: storage.clone(),
            }),
        );

        let receipt = controller.dispatch("suite-1", "manual").await.unwrap();
        assert!(receipt.dispatched);

        let execution = storage
            .get_execution(&receipt.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(!suite_logs(&storage, &receipt.execution_id)
            .await
            .iter()
            .any(|m| m == "Execution dispatched to worker"));
    }

    #[tokio::test]
    async fn test_stop_notifies_worker_best_effort() {
        let storage = seeded_storage(true).await;
        let worker = Arc::new(RecordingWorker::default());
        let controller = LifecycleController::new(storage.clone(), worker.clone());
        let receipt = controller.dispatch("suite-1", "manual").await.unwrap();

        let stopped = controller.stop(&receipt.execution_id).await.unwrap();
        assert_eq!(stopped.stopped_steps, 6);
        assert_eq!(stopped.stopped_cases, 2);
        assert!(stopped.worker_notified);
        assert_eq!(
            worker.cancelled.lock().await.as_slice(),
            &[receipt.execution_id.clone()]
        );

        assert!(matches!(
            controller.stop(&receipt.execution_id).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_succeeds_when_cancel_fails() {
        let storage = seeded_storage(true).await;
        let running = LifecycleController::new(storage.clone(), Arc::new(RecordingWorker::default()));
        let receipt = running.dispatch("suite-1", "manual").await.unwrap();

        let controller = LifecycleController::new(storage.clone(), Arc::new(DownWorker));
        let stopped = controller.stop(&receipt.execution_id).await.unwrap();
        assert!(!stopped.worker_notified);

        let execution = storage
            .get_execution(&receipt.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_retry_reuses_snapshot_verbatim() {
        let storage = seeded_storage(true).await;
        let controller =
            LifecycleController::new(storage.clone(), Arc::new(RecordingWorker::default()));
        let original = controller.dispatch("suite-1", "manual").await.unwrap();

        storage
            .save_settings(&json!({"baseUrl": "https://b.example"}))
            .await
            .unwrap();

        let retried = controller
            .retry(&original.execution_id, "manual")
            .await
            .unwrap();
        assert_ne!(retried.execution_id, original.execution_id);
        assert_eq!(retried.retry_of.as_deref(), Some(original.execution_id.as_str()));

        let before = storage
            .get_execution_origin(&original.execution_id)
            .await
            .unwrap()
            .unwrap();
        let after = storage
            .get_execution_origin(&retried.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.environment_snapshot, after.environment_snapshot);
        assert!(after
            .environment_snapshot
            .unwrap()
            .contains("https://a.example"));

        let logs = suite_logs(&storage, &retried.execution_id).await;
        assert!(logs
            .iter()
            .any(|m| m == &format!("Retry of execution {}", original.execution_id)));
    }

    #[tokio::test]
    async fn test_retry_of_missing_execution() {
        let storage = seeded_storage(true).await;
        let controller = LifecycleController::new(storage, Arc::new(RecordingWorker::default()));
        assert!(matches!(
            controller.retry("missing", "manual").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_reports_drive_suite_to_terminal() {
        let storage = seeded_storage(true).await;
        let worker = Arc::new(RecordingWorker::default());
        let controller = LifecycleController::new(storage.clone(), worker.clone());
        let receipt = controller.dispatch("suite-1", "manual").await.unwrap();
        let payload = worker.dispatched.lock().await[0].clone();

        for case in &payload.cases {
            for step in &case.steps {
                let applied = controller
                    .report_step(
                        &step.step_execution_id,
                        &StepReport {
                            status: Some(ExecutionStatus::Completed),
                            response_status: Some(200),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
                assert!(applied);
            }
            controller
                .report_case(
                    &case.case_execution_id,
                    &CaseReport {
                        status: Some(ExecutionStatus::Completed),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let execution = storage
            .get_execution(&receipt.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.passed_cases, 2);
        assert_eq!(execution.passed_steps, 6);

        // Terminal is final.
        let late = controller
            .report_suite(
                &receipt.execution_id,
                &SuiteReport {
                    status: Some(ExecutionStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!late);
    }
}
