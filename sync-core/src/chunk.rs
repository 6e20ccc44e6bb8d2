//! Chunked transfer for Clipmesh items.
//!
//! This module provides:
//! - Framing of an item as one inline message or a run of chunks
//! - Order-independent reassembly with duplicate suppression
//!
//! The payload's UTF-8 bytes are base64 encoded; the encoded length decides
//! between inline and chunked transfer, and chunks are slices of the encoded
//! text. Every chunk repeats the item metadata so the receiver can rebuild
//! the item from whichever chunk arrives first.
//!
//! Reassembly buffers are keyed by `(peer, item_id)` so two peers sending
//! items that share an id never mix their chunks. A peer may have at most
//! [`MAX_PARTIALS_PER_PEER`] items in flight, and buffers that stop
//! receiving chunks are dropped by [`Reassembler::purge_stale`].

use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::{BTreeMap, HashMap};
use sync_types::{ChannelMessage, ChunkMeta, ClipboardItem, DeviceId, ItemId};
use thiserror::Error;

/// Encoded payloads longer than this are split (12 KiB).
pub const DEFAULT_CHUNK_THRESHOLD: usize = 12 * 1024;

/// Items one peer may have partially received at once.
pub const MAX_PARTIALS_PER_PEER: usize = 16;

/// A buffer idle for longer than this is abandoned (60 s).
pub const DEFAULT_PARTIAL_TIMEOUT_MS: u64 = 60_000;

/// Reasons a chunk is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// A chunk claimed zero total chunks.
    #[error("chunk total must be positive")]
    ZeroTotal,

    /// The index is outside `0..total`.
    #[error("chunk index {index} out of range for total {total}")]
    IndexOutOfRange {
        /// Received index.
        index: u32,
        /// Declared total.
        total: u32,
    },

    /// The total disagrees with earlier chunks of the same item.
    #[error("chunk total {got} does not match earlier total {expected}")]
    TotalMismatch {
        /// Total from the first chunk.
        expected: u32,
        /// Total on this chunk.
        got: u32,
    },

    /// The peer already has too many items in flight.
    #[error("too many partial items in flight (limit {limit})")]
    TooManyPartials {
        /// Per-peer limit.
        limit: usize,
    },

    /// The reassembled payload is not valid base64 UTF-8.
    #[error("reassembled payload could not be decoded: {0}")]
    Decode(String),
}

/// Frame an item for a channel.
///
/// Returns a single `clipboard` message when the encoded payload fits in
/// `threshold`, otherwise `ceil(encoded_len / threshold)` chunk messages in
/// index order.
pub fn frame_item(item: &ClipboardItem, threshold: usize) -> Vec<ChannelMessage> {
    let threshold = threshold.max(1);
    let encoded = STANDARD.encode(item.payload.as_bytes());
    if encoded.len() <= threshold {
        return vec![ChannelMessage::Clipboard { item: item.clone() }];
    }

    let total = encoded.len().div_ceil(threshold) as u32;
    let meta = ChunkMeta::from(item);
    // base64 output is ASCII, so byte offsets are char boundaries
    (0..total)
        .map(|index| {
            let start = index as usize * threshold;
            let end = (start + threshold).min(encoded.len());
            ChannelMessage::Chunk {
                item_id: item.item_id.clone(),
                index,
                total,
                data: encoded[start..end].to_string(),
                meta: meta.clone(),
            }
        })
        .collect()
}

#[derive(Debug)]
struct PartialItem {
    total: u32,
    parts: BTreeMap<u32, String>,
    meta: ChunkMeta,
    last_chunk_at: u64,
}

/// Reassembly buffers for chunked items in flight.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<(DeviceId, ItemId), PartialItem>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one chunk from `peer`.
    ///
    /// Returns `Ok(Some(item))` once every index has arrived, `Ok(None)`
    /// while chunks are still missing or for a duplicate index. Missing
    /// metadata is filled in: the source device defaults to `peer`, the
    /// timestamp to `now`, the size to the decoded payload length.
    #[allow(clippy::too_many_arguments)]
    pub fn accept(
        &mut self,
        peer: &DeviceId,
        item_id: ItemId,
        index: u32,
        total: u32,
        data: String,
        meta: ChunkMeta,
        now: u64,
    ) -> Result<Option<ClipboardItem>, ChunkError> {
        if total == 0 {
            return Err(ChunkError::ZeroTotal);
        }
        if index >= total {
            return Err(ChunkError::IndexOutOfRange { index, total });
        }

        let key = (peer.clone(), item_id);
        if !self.buffers.contains_key(&key) && self.in_flight_for(peer) >= MAX_PARTIALS_PER_PEER {
            return Err(ChunkError::TooManyPartials {
                limit: MAX_PARTIALS_PER_PEER,
            });
        }
        let partial = self.buffers.entry(key.clone()).or_insert_with(|| PartialItem {
            total,
            parts: BTreeMap::new(),
            meta,
            last_chunk_at: now,
        });
        if partial.total != total {
            return Err(ChunkError::TotalMismatch {
                expected: partial.total,
                got: total,
            });
        }
        partial.last_chunk_at = now;
        partial.parts.entry(index).or_insert(data);
        if partial.parts.len() < partial.total as usize {
            return Ok(None);
        }

        let Some(done) = self.buffers.remove(&key) else {
            return Ok(None);
        };
        let (_, item_id) = key;
        let encoded: String = done.parts.into_values().collect();
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| ChunkError::Decode(e.to_string()))?;
        let payload = String::from_utf8(bytes).map_err(|e| ChunkError::Decode(e.to_string()))?;

        let meta = done.meta;
        let source = meta
            .device_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| peer.clone());
        Ok(Some(ClipboardItem {
            item_id,
            source_device_id: source,
            source_device_name: meta.device_name,
            timestamp: meta.ts.unwrap_or(now),
            item_type: meta.item_type.unwrap_or_default(),
            size_bytes: meta.size_bytes.unwrap_or(payload.len() as u64),
            payload,
        }))
    }

    /// Drop every buffer belonging to `peer`. Returns how many were dropped.
    pub fn discard_peer(&mut self, peer: &DeviceId) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|(owner, _), _| owner != peer);
        before - self.buffers.len()
    }

    /// Drop buffers that received no chunk for more than `max_age_ms`.
    /// Returns how many were dropped.
    pub fn purge_stale(&mut self, now: u64, max_age_ms: u64) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, partial| now.saturating_sub(partial.last_chunk_at) <= max_age_ms);
        before - self.buffers.len()
    }

    /// Number of items currently being reassembled.
    pub fn in_flight(&self) -> usize {
        self.buffers.len()
    }

    fn in_flight_for(&self, peer: &DeviceId) -> usize {
        self.buffers.keys().filter(|(owner, _)| owner == peer).count()
    }
}
