//! Error types for Clipmesh wire handling.

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum SyncError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// The frame is not valid JSON
    #[error("invalid json: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The `type` (or `kind`) discriminator is missing or unknown
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The discriminator is known but the fields do not match
    #[error("invalid message: {0}")]
    InvalidMessage(#[source] serde_json::Error),
}

impl SyncError {
    /// Wire code reported to a peer in an `error` message.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Serialization(_) => "internal_error",
            SyncError::InvalidJson(_) => "invalid_json",
            SyncError::UnknownMessageType(_) => "unknown_message_type",
            SyncError::InvalidMessage(_) => "invalid_message",
        }
    }
}
