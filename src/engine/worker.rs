//! Client for the external execution worker.
//!
//! The worker issues the HTTP calls of each step and reports results back
//! against the pre-created execution rows. Flowcheck only hands work over and
//! asks for cancellation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::CreatedCase;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Body posted to the worker when an execution is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub suite_execution_id: String,
    pub suite_id: String,
    /// Settings taken from the environment snapshot, already resolved.
    pub environment_config: Value,
    /// Case rows in suite order, each with its step rows and step configs.
    pub cases: Vec<CreatedCase>,
}

/// Boundary toward the process that actually runs the steps.
#[async_trait]
pub trait ExecutionWorker: Send + Sync {
    /// Hand a freshly created execution to the worker.
    async fn dispatch(&self, payload: &DispatchPayload) -> Result<()>;

    /// Ask the worker to stop making progress on an execution.
    async fn cancel(&self, execution_id: &str) -> Result<()>;
}

/// Worker reached over HTTP.
pub struct HttpWorker {
    client: Client,
    endpoint: String,
}

impl HttpWorker {
    pub fn new(endpoint: impl Into<String>, timeout_seconds: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build worker client with timeouts: {}", e);
                Client::new()
            });
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, path: &str, body: &Value) -> Result<()> {
        let url = format!("{}{}", self.endpoint, path);
        debug!(url = %url, "Calling worker");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("Worker unreachable at {}: {}", url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Dispatch(format!(
                "Worker rejected request ({}): {}",
                status, error_text
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionWorker for HttpWorker {
    async fn dispatch(&self, payload: &DispatchPayload) -> Result<()> {
        let body = serde_json::to_value(payload)?;
        self.post("/api/execute-suite", &body).await
    }

    async fn cancel(&self, execution_id: &str) -> Result<()> {
        self.post(
            "/api/executions/stop",
            &json!({ "execution_id": execution_id }),
        )
        .await
    }
}
