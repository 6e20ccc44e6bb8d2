//! In-memory item store.

use super::{history_limit, ItemStore, StoreError, HISTORY_LIMIT};
use async_trait::async_trait;
use std::collections::HashMap;
use sync_types::{
    ClipboardItem, Device, DeviceId, DeviceStatus, ItemId, PendingEntry, PendingStatus,
};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    // Value carries an insertion sequence for stable ordering on equal timestamps
    items: HashMap<ItemId, (u64, ClipboardItem)>,
    next_seq: u64,
    devices: HashMap<DeviceId, Device>,
    pending: HashMap<(DeviceId, ItemId), PendingEntry>,
    settings: HashMap<String, String>,
}

impl Inner {
    fn evict(&mut self, limit: usize) {
        if self.items.len() <= limit {
            return;
        }
        let mut order: Vec<(u64, u64, ItemId)> = self
            .items
            .iter()
            .map(|(id, (seq, item))| (item.timestamp, *seq, id.clone()))
            .collect();
        order.sort_unstable_by(|a, b| b.cmp(a));
        for (_, _, id) in order.into_iter().skip(limit) {
            self.items.remove(&id);
            self.pending.retain(|(_, item_id), _| *item_id != id);
        }
    }
}

/// Item store held in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn upsert_item(&self, item: &ClipboardItem) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let limit = history_limit(inner.settings.get(HISTORY_LIMIT).cloned());
        let seq = match inner.items.get(&item.item_id) {
            Some((seq, _)) => *seq,
            None => {
                inner.next_seq += 1;
                inner.next_seq
            }
        };
        inner.items.insert(item.item_id.clone(), (seq, item.clone()));
        inner.evict(limit);
        Ok(())
    }

    async fn get_item(&self, item_id: &ItemId) -> Result<Option<ClipboardItem>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.items.get(item_id).map(|(_, item)| item.clone()))
    }

    async fn list_history(&self, limit: usize) -> Result<Vec<ClipboardItem>, StoreError> {
        let inner = self.inner.lock().await;
        let mut items: Vec<&(u64, ClipboardItem)> = inner.items.values().collect();
        items.sort_by(|a, b| (b.1.timestamp, b.0).cmp(&(a.1.timestamp, a.0)));
        Ok(items
            .into_iter()
            .take(limit)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn enqueue_for_all_peers(&self, item_id: &ItemId) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let targets: Vec<DeviceId> = inner.devices.keys().cloned().collect();
        let mut created = 0;
        for target in targets {
            let key = (target.clone(), item_id.clone());
            if inner.pending.contains_key(&key) {
                continue;
            }
            inner.pending.insert(
                key,
                PendingEntry {
                    item_id: item_id.clone(),
                    target_device_id: target,
                    status: PendingStatus::Pending,
                    retries: 0,
                },
            );
            created += 1;
        }
        Ok(created)
    }

    async fn list_pending(
        &self,
        peer: &DeviceId,
        limit: usize,
    ) -> Result<Vec<ClipboardItem>, StoreError> {
        let inner = self.inner.lock().await;
        let mut items: Vec<&(u64, ClipboardItem)> = inner
            .pending
            .values()
            .filter(|e| e.target_device_id == *peer && e.status == PendingStatus::Pending)
            .filter_map(|e| inner.items.get(&e.item_id))
            .collect();
        items.sort_by_key(|(seq, item)| (item.timestamp, *seq));
        Ok(items
            .into_iter()
            .take(limit)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn pending_entry(
        &self,
        peer: &DeviceId,
        item_id: &ItemId,
    ) -> Result<Option<PendingEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.pending.get(&(peer.clone(), item_id.clone())).cloned())
    }

    async fn record_attempt(&self, peer: &DeviceId, item_id: &ItemId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.pending.get_mut(&(peer.clone(), item_id.clone())) {
            entry.retries = entry.retries.saturating_add(1);
        }
        Ok(())
    }

    async fn mark_acked(&self, peer: &DeviceId, item_id: &ItemId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.pending.get_mut(&(peer.clone(), item_id.clone())) {
            entry.status = PendingStatus::Acked;
        }
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let inner = self.inner.lock().await;
        let mut devices: Vec<Device> = inner.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    async fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(self.inner.lock().await.devices.get(device_id).cloned())
    }

    async fn upsert_device(&self, device: &Device) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.devices.get_mut(&device.device_id) {
            Some(existing) => {
                existing.name = device.name.clone();
                if !device.public_key.is_empty() {
                    existing.public_key = device.public_key.clone();
                }
                existing.status = device.status;
                if device.last_seen.is_some() {
                    existing.last_seen = device.last_seen;
                }
            }
            None => {
                inner
                    .devices
                    .insert(device.device_id.clone(), device.clone());
            }
        }
        Ok(())
    }

    async fn set_device_status(
        &self,
        device_id: &DeviceId,
        status: DeviceStatus,
        last_seen: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(device_id) {
            device.status = status;
            if last_seen.is_some() {
                device.last_seen = last_seen;
            }
        }
        Ok(())
    }

    async fn remove_device(&self, device_id: &DeviceId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.devices.remove(device_id);
        inner.pending.retain(|(target, _), _| target != device_id);
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
