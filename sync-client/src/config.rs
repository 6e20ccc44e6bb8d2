//! Client configuration.
//!
//! Loaded from TOML; every field is optional.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sync_core::{DEFAULT_CHUNK_THRESHOLD, DEFAULT_PARTIAL_TIMEOUT_MS};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay WebSocket URL.
    pub relay_url: String,
    /// Pending-queue flush period per connected peer.
    pub flush_interval_secs: u64,
    /// Relay heartbeat period.
    pub heartbeat_interval_secs: u64,
    /// How long to wait for `pair_token` before reporting a timeout.
    pub token_request_timeout_ms: u64,
    /// Encoded payloads longer than this are chunked.
    pub chunk_threshold: usize,
    /// Items sent per flush, oldest first.
    pub flush_batch: usize,
    /// Clipboard polling period.
    pub clipboard_poll_ms: u64,
    /// Partially received items idle this long are dropped.
    pub partial_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8787".to_string(),
            flush_interval_secs: 10,
            heartbeat_interval_secs: 20,
            token_request_timeout_ms: 4000,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            flush_batch: 50,
            clipboard_poll_ms: 750,
            partial_timeout_ms: DEFAULT_PARTIAL_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    /// Set the relay URL.
    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    /// Flush period as a Duration.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    /// Heartbeat period as a Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Token request timeout as a Duration.
    pub fn token_request_timeout(&self) -> Duration {
        Duration::from_millis(self.token_request_timeout_ms)
    }

    /// Clipboard polling period as a Duration.
    pub fn clipboard_poll(&self) -> Duration {
        Duration::from_millis(self.clipboard_poll_ms.max(10))
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.flush_interval(), Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(20));
        assert_eq!(config.token_request_timeout(), Duration::from_millis(4000));
        assert_eq!(config.chunk_threshold, 12 * 1024);
        assert_eq!(config.flush_batch, 50);
        assert_eq!(config.clipboard_poll(), Duration::from_millis(750));
        assert_eq!(config.partial_timeout_ms, 60_000);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            relay_url = "wss://relay.example.net/ws"
            flush_batch = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.relay_url, "wss://relay.example.net/ws");
        assert_eq!(config.flush_batch, 10);
        assert_eq!(config.heartbeat_interval_secs, 20);
    }

    #[test]
    fn from_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "flush_batch = \"many\"").unwrap();
        let err = ClientConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("failed to parse"));

        let missing = ClientConfig::from_file(Path::new("/nonexistent/clipmesh.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));
    }
}
