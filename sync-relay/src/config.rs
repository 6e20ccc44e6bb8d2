//! Configuration loading for sync-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).
//! Every section and field is optional.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for sync-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Liveness sweep configuration.
    #[serde(default)]
    pub liveness: LivenessConfig,
    /// Pairing token configuration.
    #[serde(default)]
    pub pairing: PairingConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the WebSocket and HTTP listener (default: 0.0.0.0:8787).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Liveness sweep configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    /// Sweep interval in seconds (default: 15).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Devices silent for longer than this are evicted (default: 60).
    #[serde(default = "default_liveness_timeout")]
    pub timeout_secs: u64,
    /// Enable the sweep task (default: true).
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,
}

/// Pairing token configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingConfig {
    /// Token lifetime in seconds (default: 120).
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8787".to_string()
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_liveness_timeout() -> u64 {
    60
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_token_ttl() -> u64 {
    120
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            timeout_secs: default_liveness_timeout(),
            enabled: default_sweep_enabled(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl LivenessConfig {
    /// Sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Eviction threshold as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PairingConfig {
    /// Token lifetime as a Duration.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
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
