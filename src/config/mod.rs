//! Configuration loading
//!
//! Reads an optional JSON5 file, then applies environment overrides, then
//! validates the result. A missing file means "all defaults".

pub mod types;

pub use types::{
    AuthConfig, Config, LogFormat, LoggingConfig, PollConfig, ServerConfig, DEFAULT_PORT,
};

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::polls::VoteOptions;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "POLLCAST_CONFIG_PATH";

/// Placeholder printed in place of secrets.
pub const REDACTED: &str = "***";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Resolve the config file path.
pub fn get_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pollcast")
        .join("config.json5")
}

/// Load config from the resolved path plus the process environment.
pub fn load_config() -> Result<Config, ConfigError> {
    let mut config = load_config_from(&get_config_path())?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Load config from a file only. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if raw.trim().is_empty() {
        return Ok(Config::default());
    }
    json5::from_str(&raw).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Apply environment overrides through `lookup`.
///
/// `PORT` and `SECRET_KEY` keep the names earlier deployments used.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("PORT") {
        config.server.port = port
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("PORT is not a valid port: {}", port)))?;
    }
    if let Some(bind) = lookup("POLLCAST_BIND") {
        config.server.bind = bind.trim().to_string();
    }
    if let Some(secret) = lookup("POLLCAST_ADMIN_SECRET") {
        config.auth.admin_secret = Some(secret);
    }
    if let Some(secret) = lookup("SECRET_KEY") {
        config.auth.join_secret = Some(secret);
    }
    if let Some(format) = lookup("POLLCAST_LOG_FORMAT") {
        config.logging.format = match format.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "text" => LogFormat::Text,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "POLLCAST_LOG_FORMAT must be 'json' or 'text', got '{}'",
                    other
                )))
            }
        };
    }

    // Blank secrets count as unset
    config.auth.admin_secret = non_blank(config.auth.admin_secret.take());
    config.auth.join_secret = non_blank(config.auth.join_secret.take());
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vote_options()?;
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("server.bind must not be empty".into()));
        }
        if self.server.send_queue == 0 {
            return Err(ConfigError::Invalid("server.sendQueue must be at least 1".into()));
        }
        if self.server.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.sendTimeoutMs must be at least 1".into(),
            ));
        }
        if self.server.join_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.joinTimeoutMs must be at least 1".into(),
            ));
        }
        if self.server.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.pingIntervalSecs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn vote_options(&self) -> Result<VoteOptions, ConfigError> {
        VoteOptions::new(&self.poll.options)
            .map_err(|message| ConfigError::Invalid(format!("poll.options: {}", message)))
    }

    /// Copy with secrets replaced, for printing.
    pub fn redacted(&self) -> Config {
        let mut copy = self.clone();
        if copy.auth.admin_secret.is_some() {
            copy.auth.admin_secret = Some(REDACTED.to_string());
        }
        if copy.auth.join_secret.is_some() {
            copy.auth.join_secret = Some(REDACTED.to_string());
        }
        copy
    }
}
