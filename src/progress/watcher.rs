//! Observation of one suite execution.
//!
//! The backend is picked from the current status: a terminal execution is
//! read once, a live one is polled on a timer until it settles.

use std::time::Duration;

use async_stream::stream;
use futures_util::stream::BoxStream;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};

use super::events::{LogEvent, ProgressEvent};
use crate::error::{Error, Result};
use crate::metrics::StreamClientGuard;
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{ExecutionLog, SqliteStorage};

const LOG_PAGE_SIZE: usize = 500;

/// Timing of live channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Live channels close with a timeout event after this long.
    pub max_session: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(15),
            max_session: Duration::from_secs(3600),
        }
    }
}

/// Logs of an execution, either all at once or as a live stream.
pub enum LogObservation {
    Historical(Vec<ExecutionLog>),
    Live(BoxStream<'static, LogEvent>),
}

enum Wake {
    Poll,
    Heartbeat,
    Deadline,
    Shutdown,
}

/// Read-only observer of execution progress.
#[derive(Clone)]
pub struct ExecutionWatcher {
    storage: SqliteStorage,
    settings: StreamSettings,
    shutdown: Option<ShutdownCoordinator>,
}

impl ExecutionWatcher {
    pub fn new(storage: SqliteStorage, settings: StreamSettings) -> Self {
        Self {
            storage,
            settings,
            shutdown: None,
        }
    }

    /// Close live channels when the coordinator fires.
    pub fn with_shutdown(mut self, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn settings(&self) -> StreamSettings {
        self.settings
    }

    /// Progress channel for one execution.
    ///
    /// Emits `init`, then either `complete` right away (already terminal) or
    /// an `update` per poll until `complete`, `timeout` or `error`.
    pub fn watch(&self, execution_id: String) -> BoxStream<'static, ProgressEvent> {
        let storage = self.storage.clone();
        let settings = self.settings;
        let shutdown = self.shutdown.clone();

        Box::pin(stream! {
            let _client = StreamClientGuard::new("progress");

            let hierarchy = match storage.get_hierarchy(&execution_id).await {
                Ok(Some(hierarchy)) => hierarchy,
                Ok(None) => {
                    yield ProgressEvent::error(format!("Execution '{}' not found", execution_id));
                    return;
                }
                Err(e) => {
                    error!(execution_id = %execution_id, error = %e, "Failed to read execution");
                    yield ProgressEvent::error("Failed to read execution state");
                    return;
                }
            };

            yield ProgressEvent::init(&hierarchy);
            if hierarchy.is_terminal() {
                yield ProgressEvent::complete(hierarchy);
                return;
            }

            let start = Instant::now();
            let deadline = start + settings.max_session;
            let mut poll = interval_at(start + settings.poll_interval, settings.poll_interval);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut heartbeat =
                interval_at(start + settings.heartbeat_interval, settings.heartbeat_interval);

            loop {
                let wake = tokio::select! {
                    _ = poll.tick() => Wake::Poll,
                    _ = heartbeat.tick() => Wake::Heartbeat,
                    _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                    _ = wait_for_shutdown(shutdown.as_ref()) => Wake::Shutdown,
                };

                match wake {
                    Wake::Poll => match storage.get_hierarchy(&execution_id).await {
                        Ok(Some(hierarchy)) if hierarchy.is_terminal() => {
                            yield ProgressEvent::complete(hierarchy);
                            return;
                        }
                        Ok(Some(hierarchy)) => {
                            yield ProgressEvent::Update(Box::new(hierarchy));
                        }
                        Ok(None) => {
                            yield ProgressEvent::error("Execution no longer exists");
                            return;
                        }
                        Err(e) => {
                            error!(execution_id = %execution_id, error = %e, "Progress poll failed");
                            yield ProgressEvent::error("Failed to read execution state");
                            return;
                        }
                    },
                    Wake::Heartbeat => {
                        yield ProgressEvent::Heartbeat;
                    }
                    Wake::Deadline => {
                        debug!(execution_id = %execution_id, "Progress stream reached max session");
                        yield ProgressEvent::Timeout {
                            message: "Execution exceeded the maximum stream duration".to_string(),
                        };
                        return;
                    }
                    Wake::Shutdown => {
                        let message = shutdown_message(shutdown.as_ref());
                        debug!(execution_id = %execution_id, "{}", message);
                        yield ProgressEvent::error(message);
                        return;
                    }
                }
            }
        })
    }

    /// Logs of an execution: the full history once it is terminal, otherwise
    /// a live tail that ends with the final status.
    pub async fn logs(&self, execution_id: &str) -> Result<LogObservation> {
        let execution = self
            .storage
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution '{}'", execution_id)))?;

        if execution.status.is_terminal() {
            let logs = self.read_all_logs(execution_id).await?;
            return Ok(LogObservation::Historical(logs));
        }

        Ok(LogObservation::Live(self.tail_logs(execution_id.to_string())))
    }

    async fn read_all_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>> {
        let mut logs = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self
                .storage
                .list_logs_after(execution_id, cursor, LOG_PAGE_SIZE)
                .await?;
            let done = page.len() < LOG_PAGE_SIZE;
            if let Some(last) = page.last() {
                cursor = last.id;
            }
            logs.extend(page);
            if done {
                return Ok(logs);
            }
        }
    }

    fn tail_logs(&self, execution_id: String) -> BoxStream<'static, LogEvent> {
        let storage = self.storage.clone();
        let settings = self.settings;
        let shutdown = self.shutdown.clone();

        Box::pin(stream! {
            let _client = StreamClientGuard::new("logs");
            let mut cursor = 0;

            let start = Instant::now();
            let deadline = start + settings.max_session;
            let mut poll = interval_at(start, settings.poll_interval);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut heartbeat =
                interval_at(start + settings.heartbeat_interval, settings.heartbeat_interval);

            loop {
                let wake = tokio::select! {
                    _ = poll.tick() => Wake::Poll,
                    _ = heartbeat.tick() => Wake::Heartbeat,
                    _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                    _ = wait_for_shutdown(shutdown.as_ref()) => Wake::Shutdown,
                };

                match wake {
                    Wake::Poll => {
                        // Status first: every row written before the terminal
                        // transition is drained before `end`.
                        let status = match storage.get_execution(&execution_id).await {
                            Ok(Some(execution)) => execution.status,
                            Ok(None) => {
                                yield LogEvent::Error { message: "Execution no longer exists".to_string() };
                                return;
                            }
                            Err(e) => {
                                error!(execution_id = %execution_id, error = %e, "Log poll failed");
                                yield LogEvent::Error { message: "Failed to read execution state".to_string() };
                                return;
                            }
                        };

                        loop {
                            let page = match storage.list_logs_after(&execution_id, cursor, LOG_PAGE_SIZE).await {
                                Ok(page) => page,
                                Err(e) => {
                                    error!(execution_id = %execution_id, error = %e, "Log poll failed");
                                    yield LogEvent::Error { message: "Failed to read execution logs".to_string() };
                                    return;
                                }
                            };
                            let done = page.len() < LOG_PAGE_SIZE;
                            for log in page {
                                cursor = log.id;
                                yield LogEvent::Log(Box::new(log));
                            }
                            if done {
                                break;
                            }
                        }

                        if status.is_terminal() {
                            yield LogEvent::End { status };
                            return;
                        }
                    }
                    Wake::Heartbeat => {
                        yield LogEvent::Heartbeat;
                    }
                    Wake::Deadline => {
                        yield LogEvent::Timeout {
                            message: "Execution exceeded the maximum stream duration".to_string(),
                        };
                        return;
                    }
                    Wake::Shutdown => {
                        let message = shutdown_message(shutdown.as_ref());
                        debug!(execution_id = %execution_id, "{}", message);
                        yield LogEvent::Error { message };
                        return;
                    }
                }
            }
        })
    }
}

fn shutdown_message(shutdown: Option<&ShutdownCoordinator>) -> String {
    match shutdown.and_then(|s| s.reason()) {
        Some(reason) => format!("Server shutting down ({})", reason),
        None => "Server shutting down".to_string(),
    }
}

async fn wait_for_shutdown(shutdown: Option<&ShutdownCoordinator>) {
    match shutdown {
        Some(shutdown) => shutdown.wait_for_shutdown().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::tests::seed_suite;
    use crate::storage::{
        CaseReport, CreatedHierarchy, ExecutionStatus, HierarchyPlan, LogLevel, LogScope,
        NewLogEntry, StepReport,
    };
    use futures_util::StreamExt;

    fn fast() -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_secs(3600),
            max_session: Duration::from_secs(10),
        }
    }

    async fn running_execution(storage: &SqliteStorage, cases: usize, steps: usize) -> CreatedHierarchy {
        seed_suite(storage, cases, steps).await;
        let planned = storage.get_enabled_cases("suite-1").await.unwrap();
        let created = storage
            .create_hierarchy(&HierarchyPlan {
                suite_id: "suite-1".into(),
                suite_name: "Smoke".into(),
                environment_snapshot: "{}".into(),
                triggered_by: "manual".into(),
                cases: planned,
            })
            .await
            .unwrap();
        storage.mark_suite_running(&created.execution_id).await.unwrap();
        created
    }

    /// Plays the worker: completes every step and case with short pauses.
    async fn run_to_completion(storage: SqliteStorage, created: CreatedHierarchy) {
        for case in &created.cases {
            for step in &case.steps {
                tokio::time::sleep(Duration::from_millis(15)).await;
                storage
                    .report_step(
                        &step.step_execution_id,
                        &StepReport {
                            status: Some(ExecutionStatus::Completed),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
            }
            storage
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
    }

    #[tokio::test]
    async fn test_live_execution_streams_until_complete() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = running_execution(&storage, 2, 3).await;
        let watcher = ExecutionWatcher::new(storage.clone(), fast());

        let events = watcher.watch(created.execution_id.clone());
        tokio::spawn(run_to_completion(storage.clone(), created));

        let events: Vec<ProgressEvent> =
            tokio::time::timeout(Duration::from_secs(10), events.collect())
                .await
                .unwrap();

        assert_eq!(events.first().map(|e| e.name()), Some("init"));
        assert!(events.iter().any(|e| e.name() == "update"));
        let last = events.last().unwrap();
        assert_eq!(last.name(), "complete");
        let data = last.data();
        assert_eq!(data["summary"]["status"], "completed");
        assert_eq!(data["summary"]["passed_cases"], 2);
        assert_eq!(data["summary"]["failed_cases"], 0);
        assert_eq!(data["summary"]["total_steps"], 6);
        assert_eq!(data["summary"]["passed_steps"], 6);
    }

    #[tokio::test]
    async fn test_terminal_execution_emits_init_then_complete() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = running_execution(&storage, 1, 2).await;
        storage.stop_execution(&created.execution_id).await.unwrap();

        let watcher = ExecutionWatcher::new(storage, fast());
        let names: Vec<&str> = watcher
            .watch(created.execution_id)
            .map(|e| e.name())
            .collect()
            .await;
        assert_eq!(names, vec!["init", "complete"]);
    }

    #[tokio::test]
    async fn test_missing_execution_single_error() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let watcher = ExecutionWatcher::new(storage, fast());
        let events: Vec<ProgressEvent> = watcher.watch("missing".into()).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "error");
    }

    #[tokio::test]
    async fn test_stream_times_out() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = running_execution(&storage, 1, 1).await;
        let watcher = ExecutionWatcher::new(
            storage,
            StreamSettings {
                poll_interval: Duration::from_millis(20),
                heartbeat_interval: Duration::from_millis(30),
                max_session: Duration::from_millis(150),
            },
        );

        let events: Vec<ProgressEvent> = watcher.watch(created.execution_id).collect().await;
        assert_eq!(events.last().map(|e| e.name()), Some("timeout"));
        assert!(events.iter().any(|e| e.name() == "heartbeat"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_stream() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = running_execution(&storage, 1, 1).await;
        let shutdown = ShutdownCoordinator::new();
        let watcher = ExecutionWatcher::new(storage, fast()).with_shutdown(shutdown.clone());

        let events = watcher.watch(created.execution_id);
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.request_shutdown();
        });

        let events: Vec<ProgressEvent> =
            tokio::time::timeout(Duration::from_secs(5), events.collect())
                .await
                .unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.name(), "error");
        assert_eq!(last.data()["message"], "Server shutting down (requested)");
    }

    #[tokio::test]
    async fn test_terminal_logs_are_historical() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = running_execution(&storage, 1, 1).await;
        storage
            .append_log(
                &LogScope::Suite(created.execution_id.clone()),
                &NewLogEntry::system(LogLevel::Info, "dispatched"),
            )
            .await
            .unwrap();
        storage.stop_execution(&created.execution_id).await.unwrap();

        let watcher = ExecutionWatcher::new(storage, fast());
        match watcher.logs(&created.execution_id).await.unwrap() {
            LogObservation::Historical(logs) => {
                let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
                assert_eq!(messages, vec!["dispatched", "Execution stopped by user"]);
            }
            LogObservation::Live(_) => panic!("expected historical logs"),
        }

        assert!(matches!(
            watcher.logs("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_live_logs_tail_then_end() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let created = running_execution(&storage, 1, 1).await;
        let step_id = created.cases[0].steps[0].step_execution_id.clone();
        storage
            .append_log(
                &LogScope::Suite(created.execution_id.clone()),
                &NewLogEntry::system(LogLevel::Info, "backlog"),
            )
            .await
            .unwrap();

        let watcher = ExecutionWatcher::new(storage.clone(), fast());
        let stream = match watcher.logs(&created.execution_id).await.unwrap() {
            LogObservation::Live(stream) => stream,
            LogObservation::Historical(_) => panic!("expected a live stream"),
        };

        let writer = storage.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .append_log(
                    &LogScope::Step(step_id),
                    &NewLogEntry::system(LogLevel::Success, "step passed"),
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.stop_execution(&created.execution_id).await.unwrap();
        });

        let events: Vec<LogEvent> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .unwrap();
        let messages: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                LogEvent::Log(log) => Some(log.message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            messages,
            vec!["backlog", "step passed", "Execution stopped by user"]
        );
        assert!(matches!(
            events.last(),
            Some(LogEvent::End {
                status: ExecutionStatus::Stopped
            })
        ));
    }
}
