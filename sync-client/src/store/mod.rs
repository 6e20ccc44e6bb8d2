//! Local item store for Clipmesh.
//!
//! Holds clipboard history, paired devices, the per-peer pending queue and
//! persistent settings.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use sync_types::{ClipboardItem, Device, DeviceId, DeviceStatus, ItemId, PendingEntry};
use thiserror::Error;

/// Setting: master sync switch.
pub const SYNC_ENABLED: &str = "sync_enabled";
/// Setting: whether text items are written to the clipboard.
pub const SYNC_TEXT: &str = "sync_text";
/// Setting: number of history items retained.
pub const HISTORY_LIMIT: &str = "history_limit";
/// Setting: largest local capture that is synced, in KiB.
pub const MAX_ITEM_SIZE_KB: &str = "max_item_size_kb";
/// Setting: this device's id.
pub const DEVICE_ID: &str = "device_id";
/// Setting: this device's display name.
pub const DEVICE_NAME: &str = "device_name";
/// Setting: this device's public key.
pub const PUBLIC_KEY: &str = "public_key";
/// Setting: this device's private key.
pub const PRIVATE_KEY: &str = "private_key";

/// Default retained history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
/// Default maximum capture size in KiB.
pub const DEFAULT_MAX_ITEM_SIZE_KB: u64 = 1024;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be decoded.
    #[error("corrupt {column} value: {value}")]
    Corrupt {
        /// Column or setting name.
        column: &'static str,
        /// The offending value.
        value: String,
    },
}

/// Persistence for items, devices, pending deliveries and settings.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert or replace an item by id, then evict beyond the history limit.
    async fn upsert_item(&self, item: &ClipboardItem) -> Result<(), StoreError>;

    /// Fetch one item.
    async fn get_item(&self, item_id: &ItemId) -> Result<Option<ClipboardItem>, StoreError>;

    /// Most recent items first.
    async fn list_history(&self, limit: usize) -> Result<Vec<ClipboardItem>, StoreError>;

    /// Create a pending entry for every known device. Returns how many were new.
    async fn enqueue_for_all_peers(&self, item_id: &ItemId) -> Result<usize, StoreError>;

    /// Items still pending toward `peer`, oldest first.
    async fn list_pending(
        &self,
        peer: &DeviceId,
        limit: usize,
    ) -> Result<Vec<ClipboardItem>, StoreError>;

    /// One pending-queue entry.
    async fn pending_entry(
        &self,
        peer: &DeviceId,
        item_id: &ItemId,
    ) -> Result<Option<PendingEntry>, StoreError>;

    /// Count one more delivery attempt.
    async fn record_attempt(&self, peer: &DeviceId, item_id: &ItemId) -> Result<(), StoreError>;

    /// Mark a delivery acknowledged. Unknown or already acked entries are ignored.
    async fn mark_acked(&self, peer: &DeviceId, item_id: &ItemId) -> Result<(), StoreError>;

    /// All paired devices.
    async fn list_devices(&self) -> Result<Vec<Device>, StoreError>;

    /// One paired device.
    async fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>, StoreError>;

    /// Insert or update a device.
    ///
    /// An empty incoming public key never overwrites a known one, and the
    /// original `paired_at` is kept.
    async fn upsert_device(&self, device: &Device) -> Result<(), StoreError>;

    /// Update status and last-seen of a known device.
    async fn set_device_status(
        &self,
        device_id: &DeviceId,
        status: DeviceStatus,
        last_seen: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Forget a device and its pending entries.
    async fn remove_device(&self, device_id: &DeviceId) -> Result<(), StoreError>;

    /// Read a setting.
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a setting.
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Sync-related settings, with defaults and clamping applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Master sync switch.
    pub sync_enabled: bool,
    /// Write received text to the clipboard.
    pub sync_text: bool,
    /// Retained history.
    pub history_limit: usize,
    /// Largest local capture that is synced, in KiB.
    pub max_item_size_kb: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_enabled: true,
            sync_text: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_item_size_kb: DEFAULT_MAX_ITEM_SIZE_KB,
        }
    }
}

impl SyncSettings {
    /// Load from the store.
    pub async fn load(store: &dyn ItemStore) -> Result<Self, StoreError> {
        Ok(Self {
            sync_enabled: parse_flag(store.get_setting(SYNC_ENABLED).await?),
            sync_text: parse_flag(store.get_setting(SYNC_TEXT).await?),
            history_limit: history_limit(store.get_setting(HISTORY_LIMIT).await?),
            max_item_size_kb: max_item_size_kb(store.get_setting(MAX_ITEM_SIZE_KB).await?),
        })
    }

    /// Largest local capture that is synced, in bytes.
    pub fn max_item_bytes(&self) -> u64 {
        self.max_item_size_kb * 1024
    }
}

/// Boolean setting; anything but `false`/`0` counts as on.
fn parse_flag(value: Option<String>) -> bool {
    !matches!(value.as_deref().map(str::trim), Some("false" | "0"))
}

/// History limit from its raw setting, clamped to 10–500.
pub fn history_limit(value: Option<String>) -> usize {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map(|v| v.clamp(10, 500))
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
}

/// Maximum capture size from its raw setting, clamped to 1–10240 KiB.
pub fn max_item_size_kb(value: Option<String>) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|v| v.clamp(1, 10_240))
        .unwrap_or(DEFAULT_MAX_ITEM_SIZE_KB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_limit_is_clamped() {
        assert_eq!(history_limit(None), 50);
        assert_eq!(history_limit(Some("3".into())), 10);
        assert_eq!(history_limit(Some("900".into())), 500);
        assert_eq!(history_limit(Some("120".into())), 120);
        assert_eq!(history_limit(Some("lots".into())), 50);
    }

    #[test]
    fn max_item_size_is_clamped() {
        assert_eq!(max_item_size_kb(None), 1024);
        assert_eq!(max_item_size_kb(Some("0".into())), 1);
        assert_eq!(max_item_size_kb(Some("99999".into())), 10_240);
    }

    #[test]
    fn flags_default_on() {
        assert!(parse_flag(None));
        assert!(parse_flag(Some("true".into())));
        assert!(!parse_flag(Some("false".into())));
        assert!(!parse_flag(Some("0".into())));
    }

    #[tokio::test]
    async fn settings_load_from_store() {
        let store = MemoryStore::new();
        store.set_setting(SYNC_TEXT, "false").await.unwrap();
        store.set_setting(HISTORY_LIMIT, "5").await.unwrap();

        let settings = SyncSettings::load(&store).await.unwrap();
        assert!(settings.sync_enabled);
        assert!(!settings.sync_text);
        assert_eq!(settings.history_limit, 10);
        assert_eq!(settings.max_item_bytes(), 1024 * 1024);
    }
}
