//! Configuration management.
//!
//! flowcheck configuration can come from:
//! - Environment variables (FLOWCHECK_*)
//! - Config file (~/.config/flowcheck/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::progress::StreamSettings;

/// flowcheck configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// External execution worker
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Progress and log channels
    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database, defaults to `<data dir>/flowcheck.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Base URL of the worker that runs the steps
    #[serde(default = "default_worker_endpoint")]
    pub endpoint: String,

    /// Timeout for dispatch and cancel calls (seconds)
    #[serde(default = "default_worker_timeout")]
    pub timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_worker_endpoint(),
            timeout_seconds: default_worker_timeout(),
        }
    }
}

fn default_worker_endpoint() -> String {
    "http://localhost:3001".to_string()
}

fn default_worker_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Live channels close with a timeout event after this long
    #[serde(default = "default_max_session_secs")]
    pub max_session_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_session_secs: default_max_session_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_max_session_secs() -> u64 {
    3600
}

impl StreamConfig {
    pub fn settings(&self) -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            max_session: Duration::from_secs(self.max_session_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, `RUST_LOG` wins when set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "flowcheck=info".to_string()
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let path = Self::config_dir().join("config.toml");
        match Self::load_partial_from_path(&path) {
            Ok(Some(partial)) => config.apply_partial(partial),
            Ok(None) => {}
            Err(e) => eprintln!("Ignoring {}: {}", path.display(), e),
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("flowcheck"))
            .unwrap_or_else(|| PathBuf::from(".flowcheck"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("flowcheck"))
            .unwrap_or_else(|| PathBuf::from(".flowcheck"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("flowcheck.db"))
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("FLOWCHECK_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = var("FLOWCHECK_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(path) = var("FLOWCHECK_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(endpoint) = var("FLOWCHECK_WORKER_URL") {
            self.worker.endpoint = endpoint;
        }
        if let Some(timeout) = var("FLOWCHECK_WORKER_TIMEOUT_SECONDS").and_then(|v| v.parse().ok())
        {
            self.worker.timeout_seconds = timeout;
        }
        if let Some(ms) = var("FLOWCHECK_STREAM_POLL_MS").and_then(|v| v.parse().ok()) {
            self.stream.poll_interval_ms = ms;
        }
        if let Some(secs) = var("FLOWCHECK_STREAM_HEARTBEAT_SECS").and_then(|v| v.parse().ok()) {
            self.stream.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = var("FLOWCHECK_STREAM_MAX_SECS").and_then(|v| v.parse().ok()) {
            self.stream.max_session_secs = secs;
        }
        if let Some(json) = var("FLOWCHECK_LOG_JSON") {
            self.logging.json = json.eq_ignore_ascii_case("true") || json == "1";
        }
    }

    fn load_partial_from_path(path: &Path) -> Result<Option<PartialConfig>, toml::de::Error> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Ok(None);
        };
        toml::from_str(&content).map(Some)
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(server) = partial.server {
            self.server = server;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(worker) = partial.worker {
            self.worker = worker;
        }
        if let Some(stream) = partial.stream {
            self.stream = stream;
        }
        if let Some(logging) = partial.logging {
            self.logging = logging;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    worker: Option<WorkerConfig>,
    stream: Option<StreamConfig>,
    logging: Option<LoggingConfig>,
}
