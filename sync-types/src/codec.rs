//! JSON framing shared by every message family.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::SyncError;

/// A JSON message family discriminated by a string tag field.
///
/// Decoding separates three failure classes so that callers can answer
/// with the right error code: not JSON at all, an unknown discriminator,
/// and a known discriminator with malformed fields.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Name of the discriminator field.
    const TAG: &'static str;
    /// Every discriminator value this family understands.
    const KINDS: &'static [&'static str];

    /// Encode as a JSON text frame.
    fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(SyncError::Serialization)
    }

    /// Encode as a JSON value (for embedding in another message).
    fn to_value(&self) -> Result<Value, SyncError> {
        serde_json::to_value(self).map_err(SyncError::Serialization)
    }

    /// Decode a JSON text frame.
    fn parse(text: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(text).map_err(SyncError::InvalidJson)?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON value.
    fn from_value(value: Value) -> Result<Self, SyncError> {
        let kind = value
            .get(Self::TAG)
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !Self::KINDS.contains(&kind) {
            return Err(SyncError::UnknownMessageType(kind.to_string()));
        }
        serde_json::from_value(value).map_err(SyncError::InvalidMessage)
    }
}
