//! Configuration schema for a tidemark server.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level server configuration, populated from CLI flags by the
/// node binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Master API key. Required; never persisted.
    pub secret_key: String,

    /// TCP port the WebSocket listener binds to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Data folder for persistence. `None` runs purely in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Seconds between flushes of dirty state to disk.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl ServerConfig {
    /// Minimal configuration: in-memory, default port and interval.
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            port: default_port(),
            data_dir: None,
            flush_interval_secs: default_flush_interval_secs(),
            metrics_port: None,
        }
    }

    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_key.is_empty() {
            return Err(ConfigError::Invalid("secret_key must not be empty".into()));
        }
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "flush_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// --- Defaults ---

fn default_port() -> u16 {
    8080
}
fn default_flush_interval_secs() -> u64 {
    15
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new("secret");
        assert_eq!(config.port, 8080);
        assert_eq!(config.flush_interval_secs, 15);
        assert!(config.data_dir.is_none());
        assert!(config.metrics_port.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_secret() {
        let config = ServerConfig::new("");
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("secret_key"), "error should mention secret_key: {}", err);
    }

    #[test]
    fn test_rejects_zero_flush_interval() {
        let mut config = ServerConfig::new("secret");
        config.flush_interval_secs = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(
            err.contains("flush_interval_secs"),
            "error should mention flush_interval_secs: {}",
            err
        );
    }
}
