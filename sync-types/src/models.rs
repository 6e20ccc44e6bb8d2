//! Data model shared by the client, the store and the channel protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{DeviceId, ItemId};

/// Kind of clipboard content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    /// Plain text.
    #[default]
    Text,
    /// Image, carried as a base64 data URL.
    Image,
    /// File reference or contents, carried as a base64 data URL.
    File,
}

impl ItemType {
    /// Lowercase name used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Text => "text",
            ItemType::Image => "image",
            ItemType::File => "file",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ItemType::Text),
            "image" => Ok(ItemType::Image),
            "file" => Ok(ItemType::File),
            other => Err(format!("unknown item type: {other}")),
        }
    }
}

/// One clipboard value, as stored locally and sent over a channel.
///
/// Missing fields on the wire are defaulted: `type` to text, `payload` to
/// the empty string and `size_bytes` to the payload length. A missing
/// source device or timestamp decodes as empty / zero and is filled in by
/// the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawClipboardItem")]
pub struct ClipboardItem {
    /// Unique item identifier.
    pub item_id: ItemId,
    /// Device that captured the item.
    #[serde(rename = "device_id")]
    pub source_device_id: DeviceId,
    /// Display name of the capturing device, if known.
    #[serde(rename = "device_name", skip_serializing_if = "Option::is_none")]
    pub source_device_name: Option<String>,
    /// Capture time in milliseconds since the Unix epoch.
    #[serde(rename = "ts")]
    pub timestamp: u64,
    /// Content kind.
    #[serde(rename = "type")]
    pub item_type: ItemType,
    /// Text, or a base64 data representation for binary content.
    pub payload: String,
    /// Size of the payload in bytes.
    pub size_bytes: u64,
}

#[derive(Deserialize)]
struct RawClipboardItem {
    item_id: ItemId,
    #[serde(default)]
    device_id: Option<DeviceId>,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    ts: Option<u64>,
    #[serde(default, rename = "type")]
    item_type: Option<ItemType>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    size_bytes: Option<u64>,
}

impl From<RawClipboardItem> for ClipboardItem {
    fn from(raw: RawClipboardItem) -> Self {
        let payload = raw.payload.unwrap_or_default();
        let size_bytes = raw.size_bytes.unwrap_or(payload.len() as u64);
        Self {
            item_id: raw.item_id,
            source_device_id: raw.device_id.unwrap_or_else(|| DeviceId::new("")),
            source_device_name: raw.device_name,
            timestamp: raw.ts.unwrap_or(0),
            item_type: raw.item_type.unwrap_or_default(),
            payload,
            size_bytes,
        }
    }
}

impl ClipboardItem {
    /// Build a freshly captured text item.
    pub fn text(
        source: DeviceId,
        source_name: Option<String>,
        timestamp: u64,
        text: impl Into<String>,
    ) -> Self {
        let payload = text.into();
        Self {
            item_id: ItemId::new(),
            source_device_id: source,
            source_device_name: source_name,
            timestamp,
            item_type: ItemType::Text,
            size_bytes: payload.len() as u64,
            payload,
        }
    }
}

/// Content as read from or written to the OS clipboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardContent {
    /// Content kind.
    pub item_type: ItemType,
    /// Text or base64 data representation.
    pub payload: String,
    /// Size of the payload in bytes.
    pub size_bytes: u64,
}

impl ClipboardContent {
    /// Plain text content.
    pub fn text(text: impl Into<String>) -> Self {
        let payload = text.into();
        Self {
            item_type: ItemType::Text,
            size_bytes: payload.len() as u64,
            payload,
        }
    }
}

impl From<&ClipboardItem> for ClipboardContent {
    fn from(item: &ClipboardItem) -> Self {
        Self {
            item_type: item.item_type,
            payload: item.payload.clone(),
            size_bytes: item.size_bytes,
        }
    }
}

/// Reachability of a paired device as last reported by the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Registered with the relay.
    Online,
    /// Not registered with the relay.
    Offline,
    /// No presence report seen yet.
    #[default]
    Unknown,
}

impl DeviceStatus {
    /// Lowercase name used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            "unknown" => Ok(DeviceStatus::Unknown),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}

/// A paired device as known locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Device identifier.
    pub device_id: DeviceId,
    /// Display name.
    pub name: String,
    /// Public key material, empty until the pairing key exchange completes.
    pub public_key: String,
    /// Last reported reachability.
    pub status: DeviceStatus,
    /// Last presence timestamp (ms), if any.
    pub last_seen: Option<u64>,
    /// Time the pairing was recorded (ms).
    pub paired_at: u64,
}

impl Device {
    /// A newly paired device.
    pub fn paired(device_id: DeviceId, name: impl Into<String>, public_key: impl Into<String>, now: u64) -> Self {
        Self {
            device_id,
            name: name.into(),
            public_key: public_key.into(),
            status: DeviceStatus::Unknown,
            last_seen: None,
            paired_at: now,
        }
    }
}

/// Delivery state of a pending-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingStatus {
    /// Not yet acknowledged by the target.
    Pending,
    /// Acknowledged; never re-queued.
    Acked,
}

impl PendingStatus {
    /// Lowercase name used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Acked => "acked",
        }
    }
}

impl FromStr for PendingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PendingStatus::Pending),
            "acked" => Ok(PendingStatus::Acked),
            other => Err(format!("unknown pending status: {other}")),
        }
    }
}

/// Per (item, target device) delivery ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Item to deliver.
    pub item_id: ItemId,
    /// Device that must acknowledge it.
    pub target_device_id: DeviceId,
    /// Delivery state.
    pub status: PendingStatus,
    /// Number of resend attempts so far.
    pub retries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_uses_snake_case_wire_names() {
        let item = ClipboardItem::text(DeviceId::new("a"), Some("Laptop".into()), 42, "hello");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["device_id"], "a");
        assert_eq!(json["device_name"], "Laptop");
        assert_eq!(json["ts"], 42);
        assert_eq!(json["type"], "text");
        assert_eq!(json["size_bytes"], 5);
    }

    #[test]
    fn missing_item_fields_are_defaulted() {
        let item: ClipboardItem = serde_json::from_str(r#"{"item_id":"i1","payload":"héllo"}"#).unwrap();
        assert_eq!(item.item_type, ItemType::Text);
        assert_eq!(item.size_bytes, "héllo".len() as u64);
        assert!(item.source_device_id.is_empty());
        assert_eq!(item.timestamp, 0);

        let empty: ClipboardItem = serde_json::from_str(r#"{"item_id":"i2"}"#).unwrap();
        assert_eq!(empty.payload, "");
        assert_eq!(empty.size_bytes, 0);
    }

    #[test]
    fn explicit_size_is_kept() {
        let item: ClipboardItem =
            serde_json::from_str(r#"{"item_id":"i1","type":"image","payload":"abc","size_bytes":900}"#)
                .unwrap();
        assert_eq!(item.item_type, ItemType::Image);
        assert_eq!(item.size_bytes, 900);
    }

    #[test]
    fn item_without_id_is_rejected() {
        assert!(serde_json::from_str::<ClipboardItem>(r#"{"payload":"x"}"#).is_err());
    }

    #[test]
    fn status_strings_parse() {
        assert_eq!("online".parse::<DeviceStatus>().unwrap(), DeviceStatus::Online);
        assert_eq!("acked".parse::<PendingStatus>().unwrap(), PendingStatus::Acked);
        assert!("bogus".parse::<ItemType>().is_err());
    }
}
