//! Messages exchanged between a device and the signaling relay.
//!
//! Frames are JSON text with a `type` discriminator and camelCase fields.
//! `signal` payloads are opaque to the relay and forwarded untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DeviceId, WireMessage};

/// Requests sent by a device to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Bind this connection to a device identity.
    Register {
        /// Device identifier.
        #[serde(default)]
        device_id: Option<String>,
        /// Display name.
        #[serde(default)]
        name: Option<String>,
        /// Public key material.
        #[serde(default)]
        public_key: Option<String>,
    },
    /// Keep-alive; refreshes the device's last-seen time.
    Heartbeat {},
    /// Ask for a fresh pairing token.
    RequestPairToken {},
    /// Consume a token issued to another device.
    PairWithToken {
        /// Token shown on the other device.
        token: String,
    },
    /// Relay an opaque payload to a registered device.
    Signal {
        /// Recipient.
        to: DeviceId,
        /// Opaque payload.
        payload: Value,
    },
    /// Remove the pairing with a device.
    Unpair {
        /// Device to unpair from.
        peer_id: DeviceId,
    },
    /// Ask for the presence of every paired device.
    RequestPresence {},
}

impl WireMessage for ClientMessage {
    const TAG: &'static str = "type";
    const KINDS: &'static [&'static str] = &[
        "register",
        "heartbeat",
        "request_pair_token",
        "pair_with_token",
        "signal",
        "unpair",
        "request_presence",
    ];
}

/// Replies and pushes sent by the relay to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Registration accepted.
    Registered {
        /// The registered device.
        device_id: DeviceId,
    },
    /// A request could not be handled.
    Error {
        /// Error code, e.g. `missing_fields` or `invalid_json`.
        error: String,
    },
    /// A token issued to the requester.
    PairToken {
        /// Single-use token.
        token: String,
        /// Expiry in ms since the Unix epoch.
        expires_at: u64,
    },
    /// Pairing established; sent to both sides.
    PairSuccess {
        /// The other side of the new pair.
        peer: PeerInfo,
    },
    /// Pairing rejected.
    PairFailed {
        /// Why the token was refused.
        error: PairFailure,
    },
    /// An opaque payload relayed from another device.
    Signal {
        /// Sender.
        from: DeviceId,
        /// Opaque payload.
        payload: Value,
    },
    /// The signal recipient is not connected.
    SignalFailed {
        /// Failure reason.
        error: SignalFailure,
        /// Intended recipient.
        to: DeviceId,
    },
    /// A pairing was removed.
    Unpaired {
        /// The other side of the removed pair.
        peer_id: DeviceId,
    },
    /// Presence of every paired device.
    PresenceList {
        /// One entry per paired device.
        devices: Vec<PresenceEntry>,
    },
    /// A paired device came online or went offline.
    Presence {
        /// The device whose presence changed.
        device_id: DeviceId,
        /// New status.
        status: PresenceStatus,
        /// Time of the change (ms).
        ts: u64,
    },
    /// A paired device (re-)registered with this name and key.
    DeviceInfo {
        /// The device.
        device_id: DeviceId,
        /// Display name.
        name: String,
        /// Public key material.
        public_key: String,
    },
}

impl WireMessage for ServerMessage {
    const TAG: &'static str = "type";
    const KINDS: &'static [&'static str] = &[
        "registered",
        "error",
        "pair_token",
        "pair_success",
        "pair_failed",
        "signal",
        "signal_failed",
        "unpaired",
        "presence_list",
        "presence",
        "device_info",
    ];
}

/// Identity of the other side of a pair as known to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Device identifier.
    pub device_id: DeviceId,
    /// Display name, if the device is registered.
    #[serde(default)]
    pub name: Option<String>,
    /// Public key, if the device is registered.
    #[serde(default)]
    pub public_key: Option<String>,
}

/// One row of a presence listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Device identifier.
    pub device_id: DeviceId,
    /// Whether the device is registered right now.
    pub online: bool,
    /// Display name, `"Unknown"` while offline.
    pub name: String,
    /// Last heartbeat (ms), null while offline.
    pub last_seen: Option<u64>,
    /// Public key, null while offline.
    pub public_key: Option<String>,
}

/// Presence status pushed to paired devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Registered.
    Online,
    /// Disconnected or evicted.
    Offline,
}

/// Reasons a `pair_with_token` request is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairFailure {
    /// Unknown, already consumed, or expired token.
    TokenInvalidOrExpired,
    /// The caller issued the token itself.
    CannotPairSelf,
    /// The two devices are already paired.
    AlreadyPaired,
}

/// Reasons a `signal` could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalFailure {
    /// The recipient is not connected.
    PeerOffline,
}
