//! # sync-types
//!
//! Wire format types for the Clipmesh clipboard sync protocol.
//!
//! This crate provides the foundational types used across all Clipmesh crates:
//! - [`DeviceId`], [`ItemId`] - Identity types
//! - [`ClientMessage`], [`ServerMessage`] - Device ⇄ relay signaling
//! - [`SignalPayload`] - Device ⇄ device payloads tunnelled through the relay
//! - [`ChannelMessage`] - Sync protocol over a live peer channel
//! - [`ClipboardItem`], [`Device`], [`PendingEntry`] - Data model
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod channel;
mod codec;
mod error;
mod ids;
mod models;
mod relay;
mod signal;

pub use channel::{ChannelMessage, ChunkMeta};
pub use codec::WireMessage;
pub use error::SyncError;
pub use ids::{DeviceId, ItemId};
pub use models::{
    ClipboardContent, ClipboardItem, Device, DeviceStatus, ItemType, PendingEntry, PendingStatus,
};
pub use relay::{
    ClientMessage, PairFailure, PeerInfo, PresenceEntry, PresenceStatus, ServerMessage,
    SignalFailure,
};
pub use signal::{SealedKey, SignalPayload};
