#![deny(unsafe_code)]

//! Configuration loading and validation for the allocfs agent.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP listener configuration.
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Allocation directory layout.
    #[serde(default)]
    pub alloc: AllocConfig,

    /// Log streaming tunables.
    #[serde(default)]
    pub stream: StreamConfig,
}

/// Configuration for the agent's HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address the agent listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port the agent listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
        }
    }
}

impl HttpConfig {
    /// `addr:port` form suitable for binding or connecting.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    4646
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where allocation directories live on this node.
///
/// Each allocation owns `<root>/<alloc_id>`; task logs are written to
/// `<root>/<alloc_id>/alloc/logs/<task>.<stdout|stderr>.<index>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocConfig {
    /// Directory containing one subdirectory per allocation.
    #[serde(default = "default_alloc_root")]
    pub root: String,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            root: default_alloc_root(),
        }
    }
}

fn default_alloc_root() -> String {
    "/var/lib/allocfs/alloc".to_string()
}

/// Log streaming configuration.
///
/// ## TOML Example
///
/// ```toml
/// [stream]
/// frame_size = 65536
/// heartbeat_ms = 1000
/// batch_window_ms = 200
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum payload bytes in a single frame.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    /// Idle interval after which a heartbeat frame is sent.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Pending data is flushed once it has waited this long.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// How often a followed log file is checked for changes and rotation.
    #[serde(default = "default_log_poll_ms")]
    pub log_poll_ms: u64,

    /// Buffer size of each direction of the in-process pipe.
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// How long the frame copier may keep draining after the handler returns.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// How long the HTTP layer waits for a first frame before committing a 200.
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_size: default_frame_size(),
            heartbeat_ms: default_heartbeat_ms(),
            batch_window_ms: default_batch_window_ms(),
            log_poll_ms: default_log_poll_ms(),
            pipe_capacity: default_pipe_capacity(),
            drain_timeout_ms: default_drain_timeout_ms(),
            commit_timeout_ms: default_commit_timeout_ms(),
        }
    }
}

impl StreamConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn log_poll(&self) -> Duration {
        Duration::from_millis(self.log_poll_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

fn default_frame_size() -> usize {
    64 * 1024 // 64 KiB
}

fn default_heartbeat_ms() -> u64 {
    1000
}

fn default_batch_window_ms() -> u64 {
    200
}

fn default_log_poll_ms() -> u64 {
    100
}

fn default_pipe_capacity() -> usize {
    128 * 1024
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_commit_timeout_ms() -> u64 {
    1000
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.listen_port == 0 {
            return Err(ConfigError::Validation(
                "http.listen_port must be non-zero".to_string(),
            ));
        }
        if self.http.listen_addr.is_empty() {
            return Err(ConfigError::Validation(
                "http.listen_addr must not be empty".to_string(),
            ));
        }
        if self.alloc.root.is_empty() {
            return Err(ConfigError::Validation(
                "alloc.root must not be empty".to_string(),
            ));
        }

        let stream = &self.stream;
        let non_zero = [
            ("frame_size", stream.frame_size as u64),
            ("heartbeat_ms", stream.heartbeat_ms),
            ("batch_window_ms", stream.batch_window_ms),
            ("log_poll_ms", stream.log_poll_ms),
            ("pipe_capacity", stream.pipe_capacity as u64),
            ("drain_timeout_ms", stream.drain_timeout_ms),
            ("commit_timeout_ms", stream.commit_timeout_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "stream.{field} must be non-zero"
                )));
            }
        }
        if stream.batch_window_ms > stream.heartbeat_ms {
            return Err(ConfigError::Validation(format!(
                "stream.batch_window_ms ({}) must not exceed stream.heartbeat_ms ({})",
                stream.batch_window_ms, stream.heartbeat_ms
            )));
        }

        Ok(())
    }
}
