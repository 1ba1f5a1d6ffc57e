//! Typed configuration structures
//!
//! Provides strongly-typed access to configuration values with validation
//! and default values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8001;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Listener and per-connection limits
    pub server: ServerConfig,

    /// Poll options and fan-out behavior
    pub poll: PollConfig,

    /// Shared secrets checked at join time
    pub auth: AuthConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Interface to bind, e.g. "0.0.0.0" or "127.0.0.1"
    pub bind: String,
    pub port: u16,
    /// Upper bound on a single socket write
    pub send_timeout_ms: u64,
    /// Outbound frames buffered per client; a client whose queue fills up is dropped
    pub send_queue: usize,
    /// How long a new connection has to send its join request
    pub join_timeout_ms: u64,
    pub ping_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            send_timeout_ms: 2_000,
            send_queue: 64,
            join_timeout_ms: 10_000,
            ping_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollConfig {
    /// Allowed answers; matched case-insensitively
    pub options: Vec<String>,
    /// Push the updated tally to admins after every accepted vote
    pub broadcast_tally_to_admins: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            options: vec!["yes".to_string(), "no".to_string()],
            broadcast_tally_to_admins: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    /// Secret an admin must present. Admin joins are refused when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_secret: Option<String>,
    /// Secret voters must present. Anyone may join as a voter when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_secret: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
