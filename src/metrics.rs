//! Prometheus metrics for flowcheck.
//!
//! Exposed via the /metrics endpoint.
//!
//! ## Metrics
//!
//! ### Counters
//! - `flowcheck_executions_dispatched_total` - Executions created, by outcome (dispatched, failed)
//! - `flowcheck_executions_stopped_total` - Stops, by whether the worker acknowledged the cancel
//! - `flowcheck_executions_retried_total` - Retries of earlier executions
//! - `flowcheck_worker_reports_total` - Results reported by the worker, by level and status
//! - `flowcheck_flow_validations_total` - Flow validations, by result
//!
//! ### Gauges
//! - `flowcheck_stream_clients` - Open progress and log streams

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus recorder.
///
/// Safe to call more than once; later calls return the first handle.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                tracing::warn!("A metrics recorder is already installed");
            }
            handle
        })
        .clone()
}

/// Returns None if metrics have not been initialized.
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match get_prometheus_handle() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

pub fn record_dispatch(outcome: &str) {
    counter!(
        "flowcheck_executions_dispatched_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_stop(worker_notified: bool) {
    counter!(
        "flowcheck_executions_stopped_total",
        "worker_notified" => worker_notified.to_string()
    )
    .increment(1);
}

pub fn record_retry() {
    counter!("flowcheck_executions_retried_total").increment(1);
}

/// Record a result report; `level` is suite, case or step.
pub fn record_worker_report(level: &str, status: &str) {
    counter!(
        "flowcheck_worker_reports_total",
        "level" => level.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_flow_validation(valid: bool) {
    counter!(
        "flowcheck_flow_validations_total",
        "valid" => valid.to_string()
    )
    .increment(1);
}

// =============================================================================
// Streams
// =============================================================================

/// Counts an open stream for as long as it lives.
pub struct StreamClientGuard {
    channel: &'static str,
}

impl StreamClientGuard {
    pub fn new(channel: &'static str) -> Self {
        gauge!("flowcheck_stream_clients", "channel" => channel).increment(1.0);
        Self { channel }
    }
}

impl Drop for StreamClientGuard {
    fn drop(&mut self) {
        gauge!("flowcheck_stream_clients", "channel" => self.channel).decrement(1.0);
    }
}
