//! SQLite item store.

use super::{history_limit, ItemStore, StoreError, HISTORY_LIMIT};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use sync_types::{
    ClipboardItem, Device, DeviceId, DeviceStatus, ItemId, ItemType, PendingEntry, PendingStatus,
};

/// SQLite-backed item store.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    item_id: String,
    source_device_id: String,
    source_device_name: Option<String>,
    timestamp: i64,
    item_type: String,
    payload: String,
    size_bytes: i64,
}

impl ItemRow {
    fn into_item(self) -> Result<ClipboardItem, StoreError> {
        let item_type = ItemType::from_str(&self.item_type).map_err(|_| StoreError::Corrupt {
            column: "item_type",
            value: self.item_type.clone(),
        })?;
        Ok(ClipboardItem {
            item_id: ItemId::from(self.item_id),
            source_device_id: DeviceId::new(self.source_device_id),
            source_device_name: self.source_device_name,
            timestamp: self.timestamp as u64,
            item_type,
            payload: self.payload,
            size_bytes: self.size_bytes as u64,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    name: String,
    public_key: String,
    status: String,
    last_seen: Option<i64>,
    paired_at: i64,
}

impl DeviceRow {
    fn into_device(self) -> Result<Device, StoreError> {
        let status = DeviceStatus::from_str(&self.status).map_err(|_| StoreError::Corrupt {
            column: "status",
            value: self.status.clone(),
        })?;
        Ok(Device {
            device_id: DeviceId::new(self.device_id),
            name: self.name,
            public_key: self.public_key,
            status,
            last_seen: self.last_seen.map(|v| v as u64),
            paired_at: self.paired_at as u64,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    item_id: String,
    target_device_id: String,
    status: String,
    retries: i64,
}

const ITEM_COLUMNS: &str =
    "item_id, source_device_id, source_device_name, timestamp, item_type, payload, size_bytes";

impl SqliteStore {
    /// Open (or create) a database file.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // One connection: every connection would get its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                public_key TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'unknown',
                last_seen INTEGER,
                paired_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS clipboard_items (
                item_id TEXT PRIMARY KEY,
                source_device_id TEXT NOT NULL,
                source_device_name TEXT,
                timestamp INTEGER NOT NULL,
                item_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                size_bytes INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_queue (
                item_id TEXT NOT NULL,
                target_device_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retries INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (item_id, target_device_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_timestamp ON clipboard_items(timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_target ON pending_queue(target_device_id, status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ItemStore for SqliteStore {
    async fn upsert_item(&self, item: &ClipboardItem) -> Result<(), StoreError> {
        let limit = history_limit(self.get_setting(HISTORY_LIMIT).await?);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO clipboard_items
                (item_id, source_device_id, source_device_name, timestamp, item_type, payload, size_bytes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(item_id) DO UPDATE SET
                source_device_id = excluded.source_device_id,
                source_device_name = excluded.source_device_name,
                timestamp = excluded.timestamp,
                item_type = excluded.item_type,
                payload = excluded.payload,
                size_bytes = excluded.size_bytes
            "#,
        )
        .bind(item.item_id.as_str())
        .bind(item.source_device_id.as_str())
        .bind(item.source_device_name.as_deref())
        .bind(item.timestamp as i64)
        .bind(item.item_type.as_str())
        .bind(&item.payload)
        .bind(item.size_bytes as i64)
        .execute(&mut *tx)
        .await?;

        // Evict everything past the newest `limit` items, with their deliveries
        let evicted = "SELECT item_id FROM clipboard_items \
                       ORDER BY timestamp DESC, rowid DESC LIMIT -1 OFFSET ?1";
        sqlx::query(&format!(
            "DELETE FROM pending_queue WHERE item_id IN ({evicted})"
        ))
        .bind(limit as i64)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "DELETE FROM clipboard_items WHERE item_id IN ({evicted})"
        ))
        .bind(limit as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_item(&self, item_id: &ItemId) -> Result<Option<ClipboardItem>, StoreError> {
        let row = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM clipboard_items WHERE item_id = ?1"
        ))
        .bind(item_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ItemRow::into_item).transpose()
    }

    async fn list_history(&self, limit: usize) -> Result<Vec<ClipboardItem>, StoreError> {
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM clipboard_items \
             ORDER BY timestamp DESC, rowid DESC LIMIT ?1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    async fn enqueue_for_all_peers(&self, item_id: &ItemId) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO pending_queue (item_id, target_device_id, status, retries)
            SELECT ?1, device_id, 'pending', 0 FROM devices
            "#,
        )
        .bind(item_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_pending(
        &self,
        peer: &DeviceId,
        limit: usize,
    ) -> Result<Vec<ClipboardItem>, StoreError> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT i.item_id, i.source_device_id, i.source_device_name, i.timestamp,
                   i.item_type, i.payload, i.size_bytes
            FROM pending_queue p
            JOIN clipboard_items i ON i.item_id = p.item_id
            WHERE p.target_device_id = ?1 AND p.status = 'pending'
            ORDER BY i.timestamp ASC, i.rowid ASC
            LIMIT ?2
            "#,
        )
        .bind(peer.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    async fn pending_entry(
        &self,
        peer: &DeviceId,
        item_id: &ItemId,
    ) -> Result<Option<PendingEntry>, StoreError> {
        let row = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT item_id, target_device_id, status, retries
            FROM pending_queue WHERE target_device_id = ?1 AND item_id = ?2
            "#,
        )
        .bind(peer.as_str())
        .bind(item_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let status = PendingStatus::from_str(&row.status).map_err(|_| StoreError::Corrupt {
                column: "status",
                value: row.status.clone(),
            })?;
            Ok(PendingEntry {
                item_id: ItemId::from(row.item_id),
                target_device_id: DeviceId::new(row.target_device_id),
                status,
                retries: row.retries.clamp(0, u32::MAX as i64) as u32,
            })
        })
        .transpose()
    }

    async fn record_attempt(&self, peer: &DeviceId, item_id: &ItemId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_queue SET retries = retries + 1 \
             WHERE target_device_id = ?1 AND item_id = ?2",
        )
        .bind(peer.as_str())
        .bind(item_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_acked(&self, peer: &DeviceId, item_id: &ItemId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_queue SET status = 'acked' \
             WHERE target_device_id = ?1 AND item_id = ?2 AND status = 'pending'",
        )
        .bind(peer.as_str())
        .bind(item_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, name, public_key, status, last_seen, paired_at \
             FROM devices ORDER BY device_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeviceRow::into_device).collect()
    }

    async fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>, StoreError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, name, public_key, status, last_seen, paired_at \
             FROM devices WHERE device_id = ?1",
        )
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(DeviceRow::into_device).transpose()
    }

    async fn upsert_device(&self, device: &Device) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, name, public_key, status, last_seen, paired_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(device_id) DO UPDATE SET
                name = excluded.name,
                public_key = CASE WHEN excluded.public_key = ''
                             THEN devices.public_key ELSE excluded.public_key END,
                status = excluded.status,
                last_seen = COALESCE(excluded.last_seen, devices.last_seen)
            "#,
        )
        .bind(device.device_id.as_str())
        .bind(&device.name)
        .bind(&device.public_key)
        .bind(device.status.as_str())
        .bind(device.last_seen.map(|v| v as i64))
        .bind(device.paired_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_device_status(
        &self,
        device_id: &DeviceId,
        status: DeviceStatus,
        last_seen: Option<u64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE devices SET status = ?2, last_seen = COALESCE(?3, last_seen) \
             WHERE device_id = ?1",
        )
        .bind(device_id.as_str())
        .bind(status.as_str())
        .bind(last_seen.map(|v| v as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_device(&self, device_id: &DeviceId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pending_queue WHERE target_device_id = ?1")
            .bind(device_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM devices WHERE device_id = ?1")
            .bind(device_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
