//! Application configuration for the Storeflow engine.

use std::time::Duration;

use serde::Deserialize;

/// Which persistence backend the process uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `STOREFLOW_`:
/// - `STOREFLOW_HOST`: Server bind address (default: "0.0.0.0")
/// - `STOREFLOW_PORT`: Server port (default: 8090)
/// - `STOREFLOW_STORE`: `postgres` or `memory` (default: postgres)
/// - `STOREFLOW_WORKFLOWS_DIR`: Directory of workflow definitions
/// - `STOREFLOW_EXECUTION_TIMEOUT_SECS`: Default execution deadline (default: 300)
/// - `STOREFLOW_MAX_PAUSE_DURATION_SECS`: Resume cutoff (default: 7 days)
/// - `STOREFLOW_RESUME_INTERVAL_SECS`: Resume worker interval (default: 60)
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Persistence backend
    #[serde(default)]
    pub store: StoreBackend,

    /// Directory containing workflow definitions (.json/.yaml)
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,

    /// Default execution deadline in seconds
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,

    /// Maximum time an execution may stay paused and still be resumed
    #[serde(default = "default_max_pause_duration")]
    pub max_pause_duration_secs: u64,

    /// Enable the background resume worker
    #[serde(default = "default_true")]
    pub resume_worker_enabled: bool,

    /// Resume worker cycle interval in seconds
    #[serde(default = "default_resume_interval")]
    pub resume_interval_secs: u64,

    /// Paused executions fetched per worker cycle
    #[serde(default = "default_resume_batch_size")]
    pub resume_batch_size: i64,

    /// Pause age after which the worker logs a warning
    #[serde(default = "default_pause_warning")]
    pub pause_warning_secs: u64,

    /// Default timeout for webhook sub-actions
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// TTL for cached enrichment resources
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_server_name() -> String {
    "storeflow-engine".to_string()
}

fn default_workflows_dir() -> String {
    "workflows".to_string()
}

fn default_true() -> bool {
    true
}

fn default_execution_timeout() -> u64 {
    300
}

fn default_max_pause_duration() -> u64 {
    7 * 24 * 60 * 60
}

fn default_resume_interval() -> u64 {
    60
}

fn default_resume_batch_size() -> i64 {
    50
}

fn default_pause_warning() -> u64 {
    24 * 60 * 60
}

fn default_http_timeout() -> u64 {
    30
}

fn default_cache_ttl() -> u64 {
    60
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `STOREFLOW_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("STOREFLOW_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Typed engine settings derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            execution_timeout: Duration::from_secs(self.execution_timeout_secs),
            max_pause_duration: Duration::from_secs(self.max_pause_duration_secs),
            resume_interval: Duration::from_secs(self.resume_interval_secs),
            resume_batch_size: self.resume_batch_size,
            pause_warning: Duration::from_secs(self.pause_warning_secs),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            server_name: default_server_name(),
            log_format: LogFormat::default(),
            store: StoreBackend::default(),
            workflows_dir: default_workflows_dir(),
            execution_timeout_secs: default_execution_timeout(),
            max_pause_duration_secs: default_max_pause_duration(),
            resume_worker_enabled: true,
            resume_interval_secs: default_resume_interval(),
            resume_batch_size: default_resume_batch_size(),
            pause_warning_secs: default_pause_warning(),
            http_timeout_secs: default_http_timeout(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

/// Engine tuning knobs shared by the executor, resumer and resume worker.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for one run segment of an execution.
    pub execution_timeout: Duration,
    /// Executions paused longer than this can no longer be resumed.
    pub max_pause_duration: Duration,
    pub resume_interval: Duration,
    pub resume_batch_size: i64,
    pub pause_warning: Duration,
    pub http_timeout: Duration,
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        AppConfig::default().engine_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8090);
        assert_eq!(config.store, StoreBackend::Postgres);
        assert!(config.resume_worker_enabled);
    }

    #[test]
    fn test_bind_address() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8090");
    }

    #[test]
    fn test_engine_config_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.max_pause_duration, Duration::from_secs(604_800));
        assert_eq!(engine.resume_interval, Duration::from_secs(60));
        assert_eq!(engine.pause_warning, Duration::from_secs(86_400));
        assert_eq!(engine.resume_batch_size, 50);
    }
}
