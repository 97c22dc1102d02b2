//! Server configuration and its TOML representation.
//!
//! Every field carries a serde default, so a partial file (or an empty one)
//! loads and fills the gaps:
//!
//! ```toml
//! event_loops = 4
//! max_body_length = 1048576
//! heartbeat_interval_ms = 5000
//! heartbeat_idle_ms = 30000
//! ```
//!
//! Collaborators that cannot be written as text (a custom packer, lifecycle
//! hooks, a `rustls::ServerConfig`) are passed to
//! [`ServerBuilder`](crate::server::ServerBuilder) instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Tunables for one server instance.
///
/// # Defaults
///
/// | Field                       | Default              |
/// |-----------------------------|----------------------|
/// | `event_loops`               | available CPUs       |
/// | `workers`                   | available CPUs       |
/// | `max_body_length`           | `0` (unlimited)      |
/// | `tcp_keepalive_secs`        | `0` (OS default)     |
/// | `heartbeat_interval_ms`     | `0` (disabled)       |
/// | `heartbeat_idle_ms`         | `0` (disabled)       |
/// | `udp_packet_buffer_length`  | `32768`              |
/// | `dispatch_queue_capacity`   | `128`                |
/// | `websocket_handshake_limit` | `8192`               |
/// | `listen_backlog`            | `1024`               |
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Number of poller shards.
    #[serde(default = "default_parallelism")]
    pub event_loops: usize,
    /// Maximum number of handlers running at once.
    #[serde(default = "default_parallelism")]
    pub workers: usize,
    /// Largest accepted message body in bytes; `0` disables the check.
    #[serde(default)]
    pub max_body_length: u32,
    /// TCP keepalive idle time and probe interval in seconds; `0` leaves
    /// keepalive off.
    #[serde(default)]
    pub tcp_keepalive_secs: u64,
    /// How often the idle sweep runs; `0` disables the heartbeat.
    #[serde(default)]
    pub heartbeat_interval_ms: u64,
    /// Inactivity after which the sweep closes a connection; `0` disables
    /// the heartbeat.
    #[serde(default)]
    pub heartbeat_idle_ms: u64,
    /// Receive buffer for one UDP datagram.
    #[serde(default = "default_udp_buffer")]
    pub udp_packet_buffer_length: usize,
    /// Bound of the queue between poller shards and the dispatcher.
    #[serde(default = "default_queue_capacity")]
    pub dispatch_queue_capacity: usize,
    /// Largest accepted WebSocket upgrade request in bytes.
    #[serde(default = "default_handshake_limit")]
    pub websocket_handshake_limit: usize,
    /// `listen(2)` backlog.
    #[serde(default = "default_backlog")]
    pub listen_backlog: i32,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_udp_buffer() -> usize {
    32 * 1024
}

fn default_queue_capacity() -> usize {
    128
}

fn default_handshake_limit() -> usize {
    pollnet_core::websocket::handshake::DEFAULT_HANDSHAKE_LIMIT
}

fn default_backlog() -> i32 {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            event_loops: default_parallelism(),
            workers: default_parallelism(),
            max_body_length: 0,
            tcp_keepalive_secs: 0,
            heartbeat_interval_ms: 0,
            heartbeat_idle_ms: 0,
            udp_packet_buffer_length: default_udp_buffer(),
            dispatch_queue_capacity: default_queue_capacity(),
            websocket_handshake_limit: default_handshake_limit(),
            listen_backlog: default_backlog(),
        }
    }
}

impl ServerConfig {
    /// Loads a config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Parse`]
    /// if it is not valid TOML for this schema.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str::<Self>(text)?.validate())
    }

    /// Serializes to TOML text.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Replaces values that would stall the server with their minimums.
    pub fn validate(mut self) -> Self {
        self.event_loops = self.event_loops.max(1);
        self.workers = self.workers.max(1);
        self.dispatch_queue_capacity = self.dispatch_queue_capacity.max(1);
        self.udp_packet_buffer_length = self.udp_packet_buffer_length.max(64);
        self.websocket_handshake_limit = self.websocket_handshake_limit.max(256);
        self
    }

    /// The heartbeat `(interval, idle)` pair, or `None` when disabled.
    pub fn heartbeat(&self) -> Option<(Duration, Duration)> {
        if self.heartbeat_interval_ms == 0 || self.heartbeat_idle_ms == 0 {
            return None;
        }
        Some((
            Duration::from_millis(self.heartbeat_interval_ms),
            Duration::from_millis(self.heartbeat_idle_ms),
        ))
    }

    pub fn tcp_keepalive(&self) -> Option<Duration> {
        (self.tcp_keepalive_secs > 0).then(|| Duration::from_secs(self.tcp_keepalive_secs))
    }

    pub fn max_body_length(&self) -> Option<u32> {
        (self.max_body_length > 0).then_some(self.max_body_length)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
