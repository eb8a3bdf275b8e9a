//! Configuration loading and types.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct, then checked with `garde`. Each subsection governs a
//! different part of the client: the node pool, logging and metrics export.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::errors::{Result, RiakError};
use crate::pool::PoolOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct Config {
    /// Node pool settings.
    #[serde(default)]
    #[garde(dive)]
    pub cluster: ClusterConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(dive)]
    pub logging: LoggingConfig,

    /// Metrics export settings.
    #[serde(default)]
    #[garde(skip)]
    pub observability: ObservabilityConfig,

    /// Force debug-level logging regardless of `logging.level`.
    #[serde(default)]
    #[garde(skip)]
    pub debug: bool,
}

impl Config {
    /// Run field validation, mapping failures to [`RiakError::Config`].
    pub fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|report| RiakError::Config(report.to_string()))?;
        Ok(self)
    }
}

/// Cluster membership and timing.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ClusterConfig {
    /// Ordered node addresses, `host:port` or full URLs.
    #[serde(default = "default_nodes")]
    #[garde(length(min = 1), inner(length(min = 1)))]
    pub nodes: Vec<String>,

    /// Interval between health sweeps, in milliseconds.
    #[serde(default = "default_ping_rate_ms")]
    #[garde(range(min = 1))]
    pub ping_rate_ms: u64,

    /// Per-request timeout, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    #[garde(range(min = 1))]
    pub request_timeout_ms: u64,

    /// First backoff step for an acquire while every node is down.
    #[serde(default = "default_acquire_backoff_ms")]
    #[garde(range(min = 1))]
    pub acquire_backoff_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            ping_rate_ms: default_ping_rate_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            acquire_backoff_ms: default_acquire_backoff_ms(),
        }
    }
}

impl ClusterConfig {
    pub fn ping_rate(&self) -> Duration {
        Duration::from_millis(self.ping_rate_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            ping_rate: self.ping_rate(),
            request_timeout: self.request_timeout(),
            acquire_backoff: Duration::from_millis(self.acquire_backoff_ms),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    #[garde(pattern(r"^(trace|debug|info|warn|error)$"))]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    #[garde(pattern(r"^(text|json)$"))]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObservabilityConfig {
    /// Serve Prometheus metrics on this address when set.
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
}

// -- Default value functions --------------------------------------------------

fn default_nodes() -> Vec<String> {
    vec!["127.0.0.1:8098".to_string()]
}

fn default_ping_rate_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_acquire_backoff_ms() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Parse and validate YAML configuration text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)
        .map_err(|e| RiakError::Config(format!("invalid configuration: {e}")))?;
    config.validated()
}

/// Load configuration from a YAML file at the given path.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| RiakError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_config(&contents)
}
