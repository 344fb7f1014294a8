//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `CONDUCTOR_*` environment variable overrides.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::preagg::{PreAggregationDefinition, RollupJoinDefinition, SchedulerConfig};
use crate::queue::{QueueConfig, RetryPolicy};
use crate::store::StoreConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub data_sources: BTreeMap<String, DataSourceConfig>,

    #[serde(default)]
    pub pre_aggregations: PreAggregationsConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Queue and cache timing
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_continue_wait_timeout")]
    pub continue_wait_timeout_ms: u64,

    #[serde(default = "default_stalled_query_timeout")]
    pub stalled_query_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_orphaned_timeout")]
    pub orphaned_timeout_ms: u64,

    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_ms: u64,

    #[serde(default = "default_max_stall_retries")]
    pub max_stall_retries: u32,

    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// How long refresh key query results are reused
    #[serde(default)]
    pub refresh_key_renewal_threshold_secs: Option<u64>,

    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,

    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,
}

fn default_continue_wait_timeout() -> u64 {
    5_000
}

fn default_stalled_query_timeout() -> u64 {
    120_000
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_orphaned_timeout() -> u64 {
    120_000
}

fn default_execution_timeout() -> u64 {
    600_000
}

fn default_max_stall_retries() -> u32 {
    1
}

fn default_max_transient_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_retry_max_delay() -> u64 {
    5_000
}

fn default_concurrency() -> usize {
    2
}

fn default_maintenance_interval() -> u64 {
    1_000
}

fn default_result_ttl() -> u64 {
    600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            continue_wait_timeout_ms: default_continue_wait_timeout(),
            stalled_query_timeout_ms: default_stalled_query_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            orphaned_timeout_ms: default_orphaned_timeout(),
            execution_timeout_ms: default_execution_timeout(),
            max_stall_retries: default_max_stall_retries(),
            max_transient_retries: default_max_transient_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            refresh_key_renewal_threshold_secs: None,
            default_concurrency: default_concurrency(),
            maintenance_interval_ms: default_maintenance_interval(),
            result_ttl_secs: default_result_ttl(),
        }
    }
}

/// Kind of database behind a data source
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceKind {
    #[default]
    Sqlite,
}

/// One `[data_sources.<name>]` table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataSourceConfig {
    #[serde(default)]
    pub kind: DataSourceKind,

    /// Database file; in-memory when absent
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Active queries on this data source; falls back to the default concurrency
    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default)]
    pub read_only: bool,
}

/// Pre-aggregation scheduling and the definitions to register at startup
#[derive(Debug, Clone, Deserialize)]
pub struct PreAggregationsConfig {
    #[serde(default = "default_max_partitions")]
    pub max_partitions: usize,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    #[serde(default)]
    pub external_refresh: bool,

    #[serde(default = "default_keep_versions")]
    pub keep_versions: usize,

    #[serde(default = "default_max_source_row_limit")]
    pub max_source_row_limit: usize,

    #[serde(default = "default_key_query_timeout")]
    pub key_query_timeout_secs: u64,

    #[serde(default)]
    pub definitions: Vec<PreAggregationDefinition>,

    #[serde(default)]
    pub rollup_joins: Vec<RollupJoinDefinition>,
}

fn default_max_partitions() -> usize {
    10_000
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_keep_versions() -> usize {
    2
}

fn default_max_source_row_limit() -> usize {
    10_000
}

fn default_key_query_timeout() -> u64 {
    60
}

impl Default for PreAggregationsConfig {
    fn default() -> Self {
        Self {
            max_partitions: default_max_partitions(),
            refresh_interval_secs: default_refresh_interval(),
            external_refresh: false,
            keep_versions: default_keep_versions(),
            max_source_row_limit: default_max_source_row_limit(),
            key_query_timeout_secs: default_key_query_timeout(),
            definitions: Vec::new(),
            rollup_joins: Vec::new(),
        }
    }
}

/// Admin API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_api_enabled() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4010
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

impl ApiConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("conductor").join("config.toml")),
            Some(PathBuf::from("/etc/conductor/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `CONDUCTOR_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(backend) = lookup("CONDUCTOR_STORE_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.store.backend = backend,
                Err(e) => tracing::warn!("Ignoring CONDUCTOR_STORE_BACKEND: {}", e),
            }
        }
        if let Some(path) = lookup("CONDUCTOR_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }

        if let Some(ms) = lookup("CONDUCTOR_CONTINUE_WAIT_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            self.orchestrator.continue_wait_timeout_ms = ms;
        }
        if let Some(ms) = lookup("CONDUCTOR_STALLED_QUERY_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            self.orchestrator.stalled_query_timeout_ms = ms;
        }

        if let Some(host) = lookup("CONDUCTOR_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = lookup("CONDUCTOR_API_PORT").and_then(|v| v.parse().ok()) {
            self.api.port = port;
        }

        if let Some(level) = lookup("CONDUCTOR_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("CONDUCTOR_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Queue settings, with the concurrency of every configured data source
    pub fn queue_config(&self) -> QueueConfig {
        let o = &self.orchestrator;
        let mut queue = QueueConfig {
            default_concurrency: o.default_concurrency,
            continue_wait_timeout: Duration::from_millis(o.continue_wait_timeout_ms),
            stalled_timeout: Duration::from_millis(o.stalled_query_timeout_ms),
            heartbeat_interval: Duration::from_millis(o.heartbeat_interval_ms),
            orphaned_timeout: Duration::from_millis(o.orphaned_timeout_ms),
            execution_timeout: Duration::from_millis(o.execution_timeout_ms),
            max_stall_retries: o.max_stall_retries,
            retry: RetryPolicy {
                max_retries: o.max_transient_retries,
                base_delay_ms: o.retry_base_delay_ms,
                max_delay_ms: o.retry_max_delay_ms,
            },
            maintenance_interval: Duration::from_millis(o.maintenance_interval_ms),
            result_ttl: Duration::from_secs(o.result_ttl_secs),
            ..Default::default()
        };

        for (name, data_source) in &self.data_sources {
            if let Some(concurrency) = data_source.concurrency {
                queue = queue.with_concurrency(name.as_str(), concurrency);
            }
        }
        queue
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let p = &self.pre_aggregations;
        SchedulerConfig {
            max_partitions: p.max_partitions,
            refresh_interval: Duration::from_secs(p.refresh_interval_secs.max(1)),
            external_refresh: p.external_refresh,
            keep_versions: p.keep_versions,
            max_source_row_limit: p.max_source_row_limit,
            key_query_timeout: Duration::from_secs(p.key_query_timeout_secs),
        }
    }

    pub fn key_renewal_threshold(&self) -> Option<Duration> {
        self.orchestrator
            .refresh_key_renewal_threshold_secs
            .map(Duration::from_secs)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Conductor Configuration
#
# Environment variables override these settings:
# - CONDUCTOR_STORE_BACKEND
# - CONDUCTOR_STORE_PATH
# - CONDUCTOR_CONTINUE_WAIT_TIMEOUT_MS
# - CONDUCTOR_STALLED_QUERY_TIMEOUT_MS
# - CONDUCTOR_API_HOST
# - CONDUCTOR_API_PORT
# - CONDUCTOR_LOG_LEVEL
# - CONDUCTOR_LOG_FORMAT

[orchestrator]
# How long a caller waits before being told to poll again (ms)
continue_wait_timeout_ms = 5000

# Heartbeat silence after which a running query is stalled (ms)
stalled_query_timeout_ms = 120000
heartbeat_interval_ms = 30000

# Queued queries nobody polls for this long are cancelled (ms)
orphaned_timeout_ms = 120000

# Bound on a single query execution (ms)
execution_timeout_ms = 600000

max_stall_retries = 1
max_transient_retries = 3
retry_base_delay_ms = 200
retry_max_delay_ms = 5000

# Active queries per data source unless the data source sets its own
default_concurrency = 2

# How often refresh key query results are re-executed (seconds)
# refresh_key_renewal_threshold_secs = 120

[store]
# Cache/queue backend: memory (single process) or sqlite (shared file)
backend = "memory"
# path = "/var/lib/conductor/store.db"

[data_sources.default]
kind = "sqlite"
# path = "/var/lib/conductor/default.db"
concurrency = 2
read_only = false

[pre_aggregations]
max_partitions = 10000
refresh_interval_secs = 60

# Only read partitions built by another process
external_refresh = false

# Builds kept per partition
keep_versions = 2

max_source_row_limit = 10000

# [[pre_aggregations.definitions]]
# name = "orders_monthly"
# table_name = "orders_rollup"
# data_source = "default"
# sql = "SELECT status, created_at, amount FROM orders WHERE created_at >= ? AND created_at < ?"
# params = ["__FROM_PARTITION_RANGE", "__TO_PARTITION_RANGE"]
# time_dimension = "created_at"
# granularity = "month"
# build_range = { type = "query", start_sql = "SELECT MIN(created_at) FROM orders", end_sql = "SELECT MAX(created_at) FROM orders" }
# refresh_key = { type = "every", every_secs = 3600 }

[api]
enabled = true
host = "127.0.0.1"
port = 4010

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preagg::Granularity;
    use crate::store::StoreBackend;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_parses() {
        let config = Config::parse(&generate_default_config()).unwrap();
        assert_eq!(config.orchestrator.continue_wait_timeout_ms, 5_000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.data_sources["default"].concurrency, Some(2));
        assert_eq!(config.api.port, 4010);
        assert!(config.pre_aggregations.definitions.is_empty());
    }

    #[test]
    fn test_queue_config_concurrency() {
        let config = Config::parse(
            r#"
            [orchestrator]
            default_concurrency = 3
            stalled_query_timeout_ms = 1000

            [data_sources.warehouse]
            concurrency = 8

            [data_sources.replica]
            path = "/tmp/replica.db"
            "#,
        )
        .unwrap();

        let queue = config.queue_config();
        assert_eq!(queue.concurrency_for("warehouse"), 8);
        assert_eq!(queue.concurrency_for("replica"), 3);
        assert_eq!(queue.stalled_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_definitions_from_toml() {
        let config = Config::parse(
            r#"
            [pre_aggregations]
            external_refresh = true

            [[pre_aggregations.definitions]]
            name = "orders_monthly"
            table_name = "orders_rollup"
            data_source = "default"
            sql = "SELECT * FROM orders WHERE created_at >= ? AND created_at < ?"
            params = ["__FROM_PARTITION_RANGE", "__TO_PARTITION_RANGE"]
            time_dimension = "created_at"
            granularity = "month"
            build_range = { type = "explicit", start = "2020-01-01", end = "2020-04-01" }
            refresh_key = { type = "sql", sql = "SELECT MAX(id) FROM orders" }
            "#,
        )
        .unwrap();

        assert!(config.scheduler_config().external_refresh);
        let def = &config.pre_aggregations.definitions[0];
        assert_eq!(def.granularity, Granularity::Month);
        assert!(!def.refresh_key.is_immutable());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CONDUCTOR_STORE_BACKEND", "sqlite"),
            ("CONDUCTOR_STORE_PATH", "/tmp/conductor.db"),
            ("CONDUCTOR_CONTINUE_WAIT_TIMEOUT_MS", "250"),
            ("CONDUCTOR_API_PORT", "not-a-port"),
            ("CONDUCTOR_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.path, PathBuf::from("/tmp/conductor.db"));
        assert_eq!(config.orchestrator.continue_wait_timeout_ms, 250);
        assert_eq!(config.api.port, 4010);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[api]\nport = \"nope\"\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }
}
