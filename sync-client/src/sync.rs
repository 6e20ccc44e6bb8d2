//! Item delivery over peer channels.
//!
//! [`SyncEngine`] owns the local side of the channel protocol: capturing
//! local items into the pending queue, framing items (inline or chunked),
//! applying received items and answering with acks.

use crate::client::ClientError;
use crate::clipboard::{ClipboardAdapter, ClipboardWatcher};
use crate::config::ClientConfig;
use crate::link::PeerLink;
use crate::store::{ItemStore, SyncSettings};
use std::sync::Arc;
use sync_core::{frame_item, now_ms, Reassembler};
use sync_types::{
    ChannelMessage, ClipboardContent, ClipboardItem, DeviceId, ItemId, ItemType, WireMessage,
};

/// What a received channel message amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// An item was stored (and acked).
    Applied {
        /// The stored item.
        item: ClipboardItem,
        /// Whether it was also written to the clipboard.
        written: bool,
    },
    /// The peer acknowledged one of our items.
    Acked {
        /// Acknowledged item.
        item_id: ItemId,
    },
    /// The peer asked for a flush; `sent` items went out.
    SyncRequested {
        /// Items sent in response.
        sent: usize,
    },
    /// A chunk was buffered; the item is not complete yet.
    Partial,
    /// Malformed or rejected input.
    Ignored,
}

/// Channel protocol state for all peers.
pub struct SyncEngine {
    store: Arc<dyn ItemStore>,
    clipboard: Arc<dyn ClipboardAdapter>,
    reassembler: Reassembler,
    watcher: ClipboardWatcher,
    chunk_threshold: usize,
    flush_batch: usize,
    partial_timeout_ms: u64,
}

impl SyncEngine {
    /// Create an engine over `store` and `clipboard`.
    pub fn new(
        store: Arc<dyn ItemStore>,
        clipboard: Arc<dyn ClipboardAdapter>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            store,
            clipboard,
            reassembler: Reassembler::new(),
            watcher: ClipboardWatcher::new(),
            chunk_threshold: config.chunk_threshold,
            flush_batch: config.flush_batch,
            partial_timeout_ms: config.partial_timeout_ms,
        }
    }

    /// Poll the clipboard for a new local copy.
    ///
    /// Nothing is read while sync or text sync is disabled.
    pub async fn poll_clipboard(&mut self) -> Result<Option<String>, ClientError> {
        let settings = SyncSettings::load(self.store.as_ref()).await?;
        if !settings.sync_enabled || !settings.sync_text {
            return Ok(None);
        }
        Ok(self
            .watcher
            .poll(self.clipboard.as_ref(), settings.max_item_bytes())
            .await?)
    }

    /// Record a local copy and queue it for every known peer.
    ///
    /// Returns `None` when sync is disabled or the text exceeds the size limit.
    pub async fn capture(
        &mut self,
        source: &DeviceId,
        source_name: &str,
        text: String,
    ) -> Result<Option<ClipboardItem>, ClientError> {
        let settings = SyncSettings::load(self.store.as_ref()).await?;
        if !settings.sync_enabled || !settings.sync_text {
            return Ok(None);
        }
        if text.len() as u64 > settings.max_item_bytes() {
            tracing::debug!(size = text.len(), "Capture exceeds max item size");
            return Ok(None);
        }

        self.watcher.note_applied(&text);
        let item = ClipboardItem::text(source.clone(), Some(source_name.to_string()), now_ms(), text);
        self.store.upsert_item(&item).await?;
        let queued = self.store.enqueue_for_all_peers(&item.item_id).await?;
        tracing::debug!(item_id = %item.item_id, queued, "Captured local item");
        Ok(Some(item))
    }

    /// Encode an item as channel frames.
    pub fn frames(&self, item: &ClipboardItem) -> Result<Vec<String>, ClientError> {
        frame_item(item, self.chunk_threshold)
            .iter()
            .map(|msg| msg.to_json().map_err(ClientError::from))
            .collect()
    }

    /// Send one item to `peer`, counting the attempt.
    pub async fn send_item(
        &self,
        peer: &DeviceId,
        link: &dyn PeerLink,
        item: &ClipboardItem,
    ) -> Result<(), ClientError> {
        self.store.record_attempt(peer, &item.item_id).await?;
        for frame in self.frames(item)? {
            link.send(&frame)?;
        }
        Ok(())
    }

    /// Resend everything still pending toward `peer`, oldest first.
    pub async fn flush_peer(
        &self,
        peer: &DeviceId,
        link: &dyn PeerLink,
    ) -> Result<usize, ClientError> {
        let pending = self.store.list_pending(peer, self.flush_batch).await?;
        for item in &pending {
            self.send_item(peer, link, item).await?;
        }
        if !pending.is_empty() {
            tracing::debug!(peer = %peer, count = pending.len(), "Flushed pending items");
        }
        Ok(pending.len())
    }

    /// Handle one text message from `peer`'s channel.
    pub async fn receive(
        &mut self,
        peer: &DeviceId,
        text: &str,
        link: &dyn PeerLink,
    ) -> Result<Inbound, ClientError> {
        let msg = match ChannelMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Dropping malformed channel message");
                return Ok(Inbound::Ignored);
            }
        };

        match msg {
            ChannelMessage::Clipboard { item } => self.apply_and_ack(peer, item, link).await,
            ChannelMessage::Chunk {
                item_id,
                index,
                total,
                data,
                meta,
            } => {
                let accepted =
                    self.reassembler
                        .accept(peer, item_id, index, total, data, meta, now_ms());
                match accepted {
                    Ok(Some(item)) => self.apply_and_ack(peer, item, link).await,
                    Ok(None) => Ok(Inbound::Partial),
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Dropping chunk");
                        Ok(Inbound::Ignored)
                    }
                }
            }
            ChannelMessage::Ack { item_id } => {
                self.store.mark_acked(peer, &item_id).await?;
                Ok(Inbound::Acked { item_id })
            }
            ChannelMessage::SyncRequest {} => {
                let sent = self.flush_peer(peer, link).await?;
                Ok(Inbound::SyncRequested { sent })
            }
        }
    }

    async fn apply_and_ack(
        &mut self,
        peer: &DeviceId,
        item: ClipboardItem,
        link: &dyn PeerLink,
    ) -> Result<Inbound, ClientError> {
        let (item, written) = self.apply(peer, item).await?;
        let ack = ChannelMessage::Ack {
            item_id: item.item_id.clone(),
        }
        .to_json()?;
        link.send(&ack)?;
        Ok(Inbound::Applied { item, written })
    }

    /// Store a received item and write it to the clipboard if settings allow.
    async fn apply(
        &mut self,
        peer: &DeviceId,
        mut item: ClipboardItem,
    ) -> Result<(ClipboardItem, bool), ClientError> {
        if item.source_device_id.is_empty() {
            item.source_device_id = peer.clone();
        }
        if item.timestamp == 0 {
            item.timestamp = now_ms();
        }
        self.store.upsert_item(&item).await?;

        let settings = SyncSettings::load(self.store.as_ref()).await?;
        let allowed =
            settings.sync_enabled && (item.item_type != ItemType::Text || settings.sync_text);
        if !allowed {
            return Ok((item, false));
        }

        self.clipboard
            .write(&ClipboardContent::from(&item))
            .await?;
        if item.item_type == ItemType::Text {
            self.watcher.note_applied(&item.payload);
        }
        tracing::debug!(peer = %peer, item_id = %item.item_id, "Applied remote item");
        Ok((item, true))
    }

    /// Drop partial items that stopped receiving chunks.
    pub fn purge_stale(&mut self, now: u64) -> usize {
        let dropped = self.reassembler.purge_stale(now, self.partial_timeout_ms);
        if dropped > 0 {
            tracing::debug!(dropped, "Purged stale partial items");
        }
        dropped
    }

    /// Number of partially received items.
    pub fn partials_in_flight(&self) -> usize {
        self.reassembler.in_flight()
    }

    /// Drop partially received items from `peer`.
    pub fn discard_peer(&mut self, peer: &DeviceId) {
        let dropped = self.reassembler.discard_peer(peer);
        if dropped > 0 {
            tracing::debug!(peer = %peer, dropped, "Discarded partial items");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;
    use crate::link::{LoopbackHub, Negotiator};
    use crate::store::{MemoryStore, SYNC_ENABLED, SYNC_TEXT};
    use sync_core::Role;
    use sync_types::{Device, PendingStatus};
    use tokio::sync::mpsc;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s)
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clipboard: MemoryClipboard,
        engine: SyncEngine,
        link: Box<dyn PeerLink>,
        _remote: Box<dyn PeerLink>,
        remote_rx: mpsc::UnboundedReceiver<crate::link::LinkEvent>,
    }

    impl Fixture {
        fn sent(&mut self) -> Vec<ChannelMessage> {
            let mut out = Vec::new();
            while let Ok(ev) = self.remote_rx.try_recv() {
                if let crate::link::LinkEvent::ChannelMessage { text, .. } = ev {
                    out.push(ChannelMessage::parse(&text).unwrap());
                }
            }
            out
        }
    }

    /// Engine on device "a" with an open loopback channel to "b".
    async fn fixture(config: ClientConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_device(&Device::paired(id("b"), "B", "", 1))
            .await
            .unwrap();
        let clipboard = MemoryClipboard::new();
        let engine = SyncEngine::new(store.clone(), Arc::new(clipboard.clone()), &config);

        let hub = LoopbackHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let link = hub
            .negotiator(id("a"))
            .open(&id("b"), Role::Initiator, tx)
            .await
            .unwrap();
        let remote = hub
            .negotiator(id("b"))
            .open(&id("a"), Role::Answerer, remote_tx)
            .await
            .unwrap();
        let answer = remote
            .accept_offer(link.create_offer().await.unwrap())
            .await
            .unwrap();
        link.accept_answer(answer).await.unwrap();

        let mut fixture = Fixture {
            store,
            clipboard,
            engine,
            link,
            _remote: remote,
            remote_rx,
        };
        fixture.sent();
        fixture
    }

    #[tokio::test]
    async fn capture_queues_for_known_peers() {
        let mut f = fixture(ClientConfig::default()).await;
        let item = f
            .engine
            .capture(&id("a"), "Desk", "hello".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.source_device_name.as_deref(), Some("Desk"));

        let entry = f.store.pending_entry(&id("b"), &item.item_id).await.unwrap().unwrap();
        assert_eq!(entry.status, PendingStatus::Pending);
        // Captured text is not reported again by the watcher
        f.clipboard.set_text("hello");
        assert_eq!(f.engine.poll_clipboard().await.unwrap(), None);
    }

    #[tokio::test]
    async fn capture_respects_settings() {
        let mut f = fixture(ClientConfig::default()).await;
        f.store.set_setting(SYNC_ENABLED, "false").await.unwrap();
        assert!(f
            .engine
            .capture(&id("a"), "Desk", "hello".into())
            .await
            .unwrap()
            .is_none());
        assert!(f.store.list_history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn small_items_are_sent_inline() {
        let mut f = fixture(ClientConfig::default()).await;
        let item = f
            .engine
            .capture(&id("a"), "Desk", "hello".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.engine.flush_peer(&id("b"), f.link.as_ref()).await.unwrap(), 1);
        assert_eq!(
            f.sent(),
            vec![ChannelMessage::Clipboard { item: item.clone() }]
        );

        // Unacked items are resent on every flush
        f.engine.flush_peer(&id("b"), f.link.as_ref()).await.unwrap();
        let entry = f.store.pending_entry(&id("b"), &item.item_id).await.unwrap().unwrap();
        assert_eq!(entry.retries, 2);
    }

    #[tokio::test]
    async fn large_items_are_chunked() {
        let config = ClientConfig {
            chunk_threshold: 8,
            ..ClientConfig::default()
        };
        let mut f = fixture(config).await;
        // 12 bytes encode to 16 base64 characters: two chunks
        let item = f
            .engine
            .capture(&id("a"), "Desk", "hello world!".into())
            .await
            .unwrap()
            .unwrap();
        f.engine.flush_peer(&id("b"), f.link.as_ref()).await.unwrap();

        let sent = f.sent();
        assert_eq!(sent.len(), 2);
        for (expected, msg) in sent.iter().enumerate() {
            match msg {
                ChannelMessage::Chunk {
                    item_id,
                    index,
                    total,
                    ..
                } => {
                    assert_eq!(item_id, &item.item_id);
                    assert_eq!(*index, expected as u32);
                    assert_eq!(*total, 2);
                }
                other => panic!("expected chunk, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn received_item_is_applied_and_acked() {
        let mut f = fixture(ClientConfig::default()).await;
        let item = ClipboardItem::text(id("b"), Some("B".into()), 77, "from b");
        let text = ChannelMessage::Clipboard { item: item.clone() }.to_json().unwrap();

        let inbound = f.engine.receive(&id("b"), &text, f.link.as_ref()).await.unwrap();
        assert_eq!(
            inbound,
            Inbound::Applied {
                item: item.clone(),
                written: true
            }
        );
        assert_eq!(f.clipboard.current(), Some(ClipboardContent::text("from b")));
        assert_eq!(f.store.get_item(&item.item_id).await.unwrap(), Some(item.clone()));
        assert_eq!(
            f.sent(),
            vec![ChannelMessage::Ack {
                item_id: item.item_id
            }]
        );
        // Applied text is not captured as a local change
        assert_eq!(f.engine.poll_clipboard().await.unwrap(), None);
    }

    #[tokio::test]
    async fn disabled_text_sync_still_acks() {
        let mut f = fixture(ClientConfig::default()).await;
        f.store.set_setting(SYNC_TEXT, "false").await.unwrap();
        let item = ClipboardItem::text(id("b"), None, 77, "quiet");
        let text = ChannelMessage::Clipboard { item: item.clone() }.to_json().unwrap();

        let inbound = f.engine.receive(&id("b"), &text, f.link.as_ref()).await.unwrap();
        assert!(matches!(inbound, Inbound::Applied { written: false, .. }));
        assert_eq!(f.clipboard.current(), None);
        assert_eq!(f.sent().len(), 1);
    }

    #[tokio::test]
    async fn sparse_item_gets_defaults() {
        let mut f = fixture(ClientConfig::default()).await;
        let text = r#"{"kind":"clipboard","item":{"item_id":"i9","payload":"hey"}}"#;
        let inbound = f.engine.receive(&id("b"), text, f.link.as_ref()).await.unwrap();
        match inbound {
            Inbound::Applied { item, .. } => {
                assert_eq!(item.source_device_id, id("b"));
                assert!(item.timestamp > 0);
                assert_eq!(item.item_type, ItemType::Text);
                assert_eq!(item.size_bytes, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunks_reassemble_out_of_order() {
        let mut f = fixture(ClientConfig::default()).await;
        let item = ClipboardItem::text(id("b"), None, 5, "a fairly long clipboard value");
        let frames = frame_item(&item, 8);
        assert!(frames.len() > 2);

        let mut order: Vec<&ChannelMessage> = frames.iter().rev().collect();
        order.insert(1, &frames[frames.len() - 1]);
        let mut results = Vec::new();
        for msg in order {
            let text = msg.to_json().unwrap();
            results.push(f.engine.receive(&id("b"), &text, f.link.as_ref()).await.unwrap());
        }

        let applied: Vec<&Inbound> = results
            .iter()
            .filter(|r| matches!(r, Inbound::Applied { .. }))
            .collect();
        assert_eq!(applied.len(), 1);
        assert_eq!(
            f.store.get_item(&item.item_id).await.unwrap().unwrap().payload,
            item.payload
        );
        assert_eq!(f.sent(), vec![ChannelMessage::Ack { item_id: item.item_id }]);
    }

    #[tokio::test]
    async fn ack_marks_delivery() {
        let mut f = fixture(ClientConfig::default()).await;
        let item = f
            .engine
            .capture(&id("a"), "Desk", "hello".into())
            .await
            .unwrap()
            .unwrap();
        let ack = ChannelMessage::Ack {
            item_id: item.item_id.clone(),
        }
        .to_json()
        .unwrap();
        for _ in 0..2 {
            let inbound = f.engine.receive(&id("b"), &ack, f.link.as_ref()).await.unwrap();
            assert!(matches!(inbound, Inbound::Acked { .. }));
        }
        let entry = f.store.pending_entry(&id("b"), &item.item_id).await.unwrap().unwrap();
        assert_eq!(entry.status, PendingStatus::Acked);
        assert_eq!(f.engine.flush_peer(&id("b"), f.link.as_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sync_request_flushes() {
        let mut f = fixture(ClientConfig::default()).await;
        f.engine
            .capture(&id("a"), "Desk", "one".into())
            .await
            .unwrap();
        let request = ChannelMessage::SyncRequest {}.to_json().unwrap();
        let inbound = f.engine.receive(&id("b"), &request, f.link.as_ref()).await.unwrap();
        assert_eq!(inbound, Inbound::SyncRequested { sent: 1 });
        assert_eq!(f.sent().len(), 1);
    }

    #[tokio::test]
    async fn malformed_messages_are_ignored() {
        let mut f = fixture(ClientConfig::default()).await;
        for text in ["nope", r#"{"kind":"teleport"}"#, r#"{"kind":"ack"}"#] {
            let inbound = f.engine.receive(&id("b"), text, f.link.as_ref()).await.unwrap();
            assert_eq!(inbound, Inbound::Ignored);
        }
        let bad_chunk = r#"{"kind":"chunk","item_id":"x","index":3,"total":2,"data":"aGk="}"#;
        assert_eq!(
            f.engine.receive(&id("b"), bad_chunk, f.link.as_ref()).await.unwrap(),
            Inbound::Ignored
        );
        assert!(f.sent().is_empty());
    }

    #[tokio::test]
    async fn abandoned_chunks_are_purged() {
        let mut f = fixture(ClientConfig::default()).await;
        let item = ClipboardItem::text(id("b"), None, 5, "a fairly long clipboard value");
        let frames = frame_item(&item, 8);
        let first = frames[0].to_json().unwrap();
        assert_eq!(
            f.engine.receive(&id("b"), &first, f.link.as_ref()).await.unwrap(),
            Inbound::Partial
        );
        assert_eq!(f.engine.partials_in_flight(), 1);

        assert_eq!(f.engine.purge_stale(now_ms()), 0);
        assert_eq!(f.engine.purge_stale(now_ms() + 60_001), 1);
        assert_eq!(f.engine.partials_in_flight(), 0);
        assert!(f.sent().is_empty());
    }
}
