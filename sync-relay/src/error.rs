//! Error types for sync-relay.

/// Main error type for sync-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bind address could not be parsed.
    #[error("invalid bind address {address}: {reason}")]
    InvalidBindAddress {
        /// The configured address.
        address: String,
        /// Parser message.
        reason: String,
    },

    /// The coordinator task is gone.
    #[error("relay coordinator has shut down")]
    CoordinatorClosed,
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
