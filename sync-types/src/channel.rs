//! Messages exchanged between two devices over a live peer channel.
//!
//! Frames are JSON text with a `kind` discriminator and snake_case fields.

use serde::{Deserialize, Serialize};

use crate::{ClipboardItem, DeviceId, ItemId, ItemType, WireMessage};

/// Sync protocol messages carried on a peer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// A whole item, sent inline.
    Clipboard {
        /// The item.
        item: ClipboardItem,
    },
    /// One slice of an oversized item's encoded payload.
    Chunk {
        /// Item being transferred.
        item_id: ItemId,
        /// Zero-based slice index.
        index: u32,
        /// Total number of slices.
        total: u32,
        /// Slice of the base64-encoded payload.
        #[serde(default)]
        data: String,
        /// Item metadata, repeated on every slice.
        #[serde(default)]
        meta: ChunkMeta,
    },
    /// The item has been applied by the receiver.
    Ack {
        /// Acknowledged item.
        item_id: ItemId,
    },
    /// Ask the other side to flush its pending queue toward us.
    SyncRequest {},
}

impl WireMessage for ChannelMessage {
    const TAG: &'static str = "kind";
    const KINDS: &'static [&'static str] = &["clipboard", "chunk", "ack", "sync_request"];
}

/// Item metadata carried on each chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Capturing device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    /// Capturing device's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Capture time (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    /// Content kind.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub item_type: Option<ItemType>,
    /// Size of the decoded payload in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl From<&ClipboardItem> for ChunkMeta {
    fn from(item: &ClipboardItem) -> Self {
        Self {
            device_id: Some(item.source_device_id.clone()),
            device_name: item.source_device_name.clone(),
            ts: Some(item.timestamp),
            item_type: Some(item.item_type),
            size_bytes: Some(item.size_bytes),
        }
    }
}
