//! Clipboard adapter and change watcher.
//!
//! The OS clipboard is an external capability. [`ClipboardWatcher`] polls an
//! adapter and reports text that differs from what it last saw or applied,
//! so items written by the sync engine are not captured again.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use sync_types::{ClipboardContent, ItemType};
use thiserror::Error;

/// Clipboard access errors.
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// The platform clipboard is unavailable.
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
}

/// Read and write access to a clipboard.
#[async_trait]
pub trait ClipboardAdapter: Send + Sync {
    /// Current content, if any.
    async fn read(&self) -> Result<Option<ClipboardContent>, ClipboardError>;

    /// Replace the content.
    async fn write(&self, content: &ClipboardContent) -> Result<(), ClipboardError>;
}

/// In-memory clipboard.
///
/// Clones share the same content.
#[derive(Debug, Default, Clone)]
pub struct MemoryClipboard {
    content: Arc<Mutex<Option<ClipboardContent>>>,
}

impl MemoryClipboard {
    /// Create an empty clipboard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the user copying text.
    pub fn set_text(&self, text: &str) {
        *self.lock() = Some(ClipboardContent::text(text));
    }

    /// Current content without going through the adapter.
    pub fn current(&self) -> Option<ClipboardContent> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ClipboardContent>> {
        self.content.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ClipboardAdapter for MemoryClipboard {
    async fn read(&self) -> Result<Option<ClipboardContent>, ClipboardError> {
        Ok(self.current())
    }

    async fn write(&self, content: &ClipboardContent) -> Result<(), ClipboardError> {
        *self.lock() = Some(content.clone());
        Ok(())
    }
}

/// Detects local clipboard changes by polling.
#[derive(Debug, Default)]
pub struct ClipboardWatcher {
    last_seen: Option<String>,
}

impl ClipboardWatcher {
    /// Create a watcher that has seen nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the clipboard and return newly copied text.
    ///
    /// Non-text content, empty text, an unchanged value and text longer than
    /// `max_bytes` yield `None`. Oversized text still counts as seen.
    pub async fn poll(
        &mut self,
        adapter: &dyn ClipboardAdapter,
        max_bytes: u64,
    ) -> Result<Option<String>, ClipboardError> {
        let Some(content) = adapter.read().await? else {
            return Ok(None);
        };
        if content.item_type != ItemType::Text || content.payload.is_empty() {
            return Ok(None);
        }
        if self.last_seen.as_deref() == Some(content.payload.as_str()) {
            return Ok(None);
        }
        self.last_seen = Some(content.payload.clone());

        if content.payload.len() as u64 > max_bytes {
            tracing::debug!(
                size = content.payload.len(),
                max_bytes,
                "Skipping oversized clipboard capture"
            );
            return Ok(None);
        }
        Ok(Some(content.payload))
    }

    /// Remember text written by the sync engine so it is not reported.
    pub fn note_applied(&mut self, text: &str) {
        self.last_seen = Some(text.to_string());
    }
}
