//! ClipClient - the Clipmesh device runtime.
//!
//! This module provides [`ClipClient`], which keeps one device's clipboard
//! in sync with its paired peers, and [`ClientHandle`], the application's
//! way to drive it.
//!
//! # Architecture
//!
//! All handling is serialized on one dispatcher. Relay frames, peer link
//! events, application commands and timers are multiplexed with
//! `tokio::select!`; pure state machines from sync-core decide what to do
//! and the client interprets their actions.
//!
//! ```text
//! Relay ──frames──┐
//! Links ──events──┼─→ ClipClient ─→ RelayLinkState / PeerState (sync-core)
//! App ──commands──┘        │
//!                          └─→ SyncEngine ─→ ItemStore, ClipboardAdapter
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sync_client::{ClientConfig, ClipClient, MemoryClipboard, SettingsIdentity,
//!                   SqliteStore, WebSocketTransport};
//!
//! let store = Arc::new(SqliteStore::open("clipmesh.db".as_ref()).await?);
//! let identity = Arc::new(SettingsIdentity::new(store.clone()));
//! let (client, handle) = ClipClient::new(
//!     ClientConfig::default(),
//!     WebSocketTransport::new(),
//!     negotiator,
//!     store,
//!     Arc::new(MemoryClipboard::new()),
//!     identity,
//! )
//! .await?;
//! tokio::spawn(client.run());
//! handle.request_pair_token()?;
//! ```

use crate::clipboard::{ClipboardAdapter, ClipboardError};
use crate::config::ClientConfig;
use crate::crypto::CryptoError;
use crate::handshake::Handshake;
use crate::identity::{Identity, IdentityError, IdentityProvider};
use crate::link::{LinkError, LinkEvent, Negotiator, PeerLink};
use crate::peers::PeerManager;
use crate::store::{ItemStore, StoreError};
use crate::sync::{Inbound, SyncEngine};
use crate::transport::{Transport, TransportError};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use sync_core::{
    now_ms, PeerAction, PeerEvent, PeerState, RelayAction, RelayEvent, RelayLinkState,
    RelayStatus,
};
use sync_types::{
    ChannelMessage, ClientMessage, ClipboardItem, Device, DeviceId, DeviceStatus, PairFailure,
    PeerInfo, PresenceEntry, PresenceStatus, ServerMessage, SignalPayload, SyncError,
    WireMessage,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Name recorded for peers that never told us theirs.
const UNKNOWN_NAME: &str = "Unknown";

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Peer link error.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Identity error.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Clipboard error.
    #[error("clipboard error: {0}")]
    Clipboard(#[from] ClipboardError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] SyncError),

    /// The dispatcher has stopped.
    #[error("client has shut down")]
    Closed,
}

/// Requests from the application to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the relay for a pairing token.
    RequestPairToken,
    /// Pair using a token shown on another device.
    PairWithToken {
        /// The token.
        token: String,
    },
    /// Remove a pairing.
    Unpair {
        /// The peer to forget.
        peer: DeviceId,
    },
    /// Change this device's display name.
    Rename {
        /// New name.
        name: String,
    },
    /// Treat `text` as a local copy.
    Capture {
        /// Copied text.
        text: String,
    },
    /// Disconnect and stop the dispatcher.
    Shutdown,
}

/// Notifications from the dispatcher to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The relay accepted our registration.
    Registered {
        /// Our device id.
        device_id: DeviceId,
    },
    /// A pairing token was issued to us.
    PairTokenIssued {
        /// Token to show to the user.
        token: String,
        /// Expiry in ms since the epoch.
        expires_at: u64,
    },
    /// No token arrived in time.
    PairTokenTimeout,
    /// A pairing was established.
    PairSucceeded {
        /// The new peer.
        peer: DeviceId,
        /// Its name, if the relay knew it.
        name: Option<String>,
    },
    /// Pairing was refused.
    PairFailed {
        /// Why.
        reason: PairFailure,
    },
    /// A peer's public key arrived through the pairing handshake.
    PeerKeyReceived {
        /// The peer.
        peer: DeviceId,
    },
    /// A paired device came online or went offline.
    PresenceChanged {
        /// The device.
        peer: DeviceId,
        /// Whether it is online.
        online: bool,
    },
    /// An item arrived from a peer.
    ItemReceived {
        /// Sending peer.
        from: DeviceId,
        /// The item.
        item: ClipboardItem,
    },
    /// The relay could not deliver a signal.
    SignalFailed {
        /// Intended recipient.
        to: DeviceId,
    },
    /// A pairing was removed.
    Unpaired {
        /// The former peer.
        peer: DeviceId,
    },
    /// The relay connection dropped.
    RelayDisconnected {
        /// Reason for disconnection.
        reason: String,
    },
}

/// Cloneable control handle for a running [`ClipClient`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientHandle {
    /// Queue a command.
    pub fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    /// Ask the relay for a pairing token.
    pub fn request_pair_token(&self) -> Result<(), ClientError> {
        self.send(Command::RequestPairToken)
    }

    /// Pair using a token shown on another device.
    pub fn pair_with_token(&self, token: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::PairWithToken {
            token: token.into(),
        })
    }

    /// Remove a pairing.
    pub fn unpair(&self, peer: DeviceId) -> Result<(), ClientError> {
        self.send(Command::Unpair { peer })
    }

    /// Change this device's display name.
    pub fn rename(&self, name: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::Rename { name: name.into() })
    }

    /// Treat `text` as a local copy.
    pub fn capture(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::Capture { text: text.into() })
    }

    /// Disconnect and stop the dispatcher.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        self.send(Command::Shutdown)
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// One frame (or the terminal error) read from the relay.
#[derive(Debug)]
struct RelayInput {
    // Frames from a replaced reader are ignored
    generation: u64,
    frame: Result<String, TransportError>,
}

struct Inputs {
    commands: mpsc::UnboundedReceiver<Command>,
    relay: mpsc::UnboundedReceiver<RelayInput>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// The Clipmesh device runtime.
pub struct ClipClient<T: Transport + 'static> {
    config: ClientConfig,
    identity: Identity,
    identity_provider: Arc<dyn IdentityProvider>,
    transport: Arc<T>,
    negotiator: Arc<dyn Negotiator>,
    store: Arc<dyn ItemStore>,
    engine: SyncEngine,
    peers: PeerManager,
    handshake: Handshake,
    relay: RelayLinkState,
    relay_tx: mpsc::UnboundedSender<RelayInput>,
    generation: u64,
    reader: Option<JoinHandle<()>>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    events: broadcast::Sender<ClientEvent>,
    inputs: Option<Inputs>,
    pending_token_request: bool,
    token_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl<T: Transport + 'static> ClipClient<T> {
    /// Create a client and its control handle.
    ///
    /// Loads (or creates) the device identity. Nothing is connected until
    /// [`run`](Self::run) or [`connect`](Self::connect).
    pub async fn new(
        config: ClientConfig,
        transport: T,
        negotiator: Arc<dyn Negotiator>,
        store: Arc<dyn ItemStore>,
        clipboard: Arc<dyn ClipboardAdapter>,
        identity_provider: Arc<dyn IdentityProvider>,
    ) -> Result<(Self, ClientHandle), ClientError> {
        let identity = identity_provider.get_or_create_identity().await?;
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (relay_tx, relay) = mpsc::unbounded_channel();
        let (link_tx, link_events) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = ClientHandle {
            commands: commands_tx,
            events: events.clone(),
        };
        let client = Self {
            engine: SyncEngine::new(store.clone(), clipboard, &config),
            peers: PeerManager::new(identity.device_id.clone()),
            config,
            identity,
            identity_provider,
            transport: Arc::new(transport),
            negotiator,
            store,
            handshake: Handshake::new(),
            relay: RelayLinkState::new(),
            relay_tx,
            generation: 0,
            reader: None,
            link_tx,
            events,
            inputs: Some(Inputs {
                commands,
                relay,
                link_events,
            }),
            pending_token_request: false,
            token_deadline: None,
            reconnect_at: None,
        };
        Ok((client, handle))
    }

    /// This device's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// State of the relay connection.
    pub fn relay_state(&self) -> RelayLinkState {
        self.relay
    }

    /// Peer connection records.
    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Run the dispatcher until shutdown or until every handle is dropped.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let Some(mut inputs) = self.inputs.take() else {
            return Ok(());
        };
        self.connect().await;

        let mut flush = time::interval(self.config.flush_interval());
        let mut heartbeat = time::interval(self.config.heartbeat_interval());
        let mut poll = time::interval(self.config.clipboard_poll());
        for timer in [&mut flush, &mut heartbeat, &mut poll] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        flush.reset();
        heartbeat.reset();

        loop {
            let token_deadline = self.token_deadline;
            let reconnect_at = self.reconnect_at;
            let result = tokio::select! {
                command = inputs.commands.recv() => match command {
                    Some(command) => match self.handle_command(command).await {
                        Ok(true) => Ok(()),
                        Ok(false) => break,
                        Err(e) => Err(e),
                    },
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(input) = inputs.relay.recv() => self.handle_relay_input(input).await,
                Some(event) = inputs.link_events.recv() => self.handle_link_event(event).await,
                _ = flush.tick() => self.flush().await,
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                    Ok(())
                }
                _ = poll.tick() => self.poll_clipboard().await,
                _ = wait_until(token_deadline) => {
                    self.token_request_expired();
                    Ok(())
                }
                _ = wait_until(reconnect_at) => {
                    self.reconnect_at = None;
                    self.relay_event(RelayEvent::ReconnectTimer).await;
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "Dispatcher step failed");
            }
        }

        tracing::info!(device_id = %self.identity.device_id, "Client stopped");
        Ok(())
    }

    // ===========================================
    // Relay link
    // ===========================================

    /// Start connecting to the relay.
    pub async fn connect(&mut self) {
        self.relay_event(RelayEvent::ConnectRequested).await;
    }

    async fn shutdown(&mut self) {
        self.token_deadline = None;
        self.relay_event(RelayEvent::DisconnectRequested).await;
        self.stop_reader();
        self.peers.clear();
    }

    async fn relay_event(&mut self, event: RelayEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let (next, actions) = self.relay.on_event(event);
            self.relay = next;
            for action in actions {
                if let Some(follow) = self.run_relay_action(action).await {
                    queue.push_back(follow);
                }
            }
        }
    }

    async fn run_relay_action(&mut self, action: RelayAction) -> Option<RelayEvent> {
        match action {
            RelayAction::Connect => {
                self.stop_reader();
                match self.transport.connect(&self.config.relay_url).await {
                    Ok(()) => {
                        tracing::info!(url = %self.config.relay_url, "Connected to relay");
                        self.start_reader();
                        Some(RelayEvent::ConnectSucceeded)
                    }
                    Err(e) => Some(RelayEvent::ConnectFailed {
                        error: e.to_string(),
                    }),
                }
            }
            RelayAction::Disconnect => {
                self.stop_reader();
                if let Err(e) = self.transport.close().await {
                    tracing::debug!(error = %e, "Relay close failed");
                }
                None
            }
            RelayAction::SendRegistration => {
                let register = self.registration();
                self.send_relay(&register).await;
                None
            }
            RelayAction::RequestPresence => {
                self.send_relay(&ClientMessage::RequestPresence {}).await;
                if std::mem::take(&mut self.pending_token_request) {
                    self.send_token_request().await;
                }
                None
            }
            RelayAction::StartReconnectTimer { delay } => {
                tracing::debug!(?delay, "Scheduling relay reconnect");
                self.reconnect_at = Some(Instant::now() + delay);
                None
            }
            RelayAction::CancelReconnect => {
                self.reconnect_at = None;
                None
            }
            RelayAction::EmitEvent(status) => {
                self.report_relay_status(status);
                None
            }
        }
    }

    fn report_relay_status(&self, status: RelayStatus) {
        match status {
            RelayStatus::Registered => {
                tracing::info!(device_id = %self.identity.device_id, "Registered with relay");
                self.emit(ClientEvent::Registered {
                    device_id: self.identity.device_id.clone(),
                });
            }
            RelayStatus::Disconnected { reason } => {
                tracing::warn!(%reason, "Relay connection lost");
                self.emit(ClientEvent::RelayDisconnected { reason });
            }
            RelayStatus::ConnectionFailed { error } => {
                tracing::warn!(%error, "Relay connection failed");
            }
            RelayStatus::ReconnectFailed { attempt, error } => {
                tracing::warn!(attempt, %error, "Relay reconnect failed");
            }
        }
    }

    fn start_reader(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let transport = Arc::clone(&self.transport);
        let tx = self.relay_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            loop {
                let frame = transport.recv().await;
                let done = frame.is_err();
                if tx.send(RelayInput { generation, frame }).is_err() || done {
                    break;
                }
            }
        }));
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn registration(&self) -> ClientMessage {
        ClientMessage::Register {
            device_id: Some(self.identity.device_id.to_string()),
            name: Some(self.identity.name.clone()),
            public_key: Some(self.identity.public_key.clone()),
        }
    }

    /// Fire-and-forget send to the relay. Returns whether the frame went out.
    async fn send_relay(&self, msg: &ClientMessage) -> bool {
        let frame = match msg.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode relay message");
                return false;
            }
        };
        match self.transport.send(&frame).await {
            Ok(()) => true,
            Err(TransportError::NotConnected) => {
                tracing::debug!("Relay not connected, dropping frame");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Relay send failed");
                false
            }
        }
    }

    async fn send_signal(&self, to: &DeviceId, payload: SignalPayload) -> Result<(), ClientError> {
        let payload = payload.to_value()?;
        self.send_relay(&ClientMessage::Signal {
            to: to.clone(),
            payload,
        })
        .await;
        Ok(())
    }

    async fn send_token_request(&mut self) {
        if self.send_relay(&ClientMessage::RequestPairToken {}).await {
            self.token_deadline = Some(Instant::now() + self.config.token_request_timeout());
        }
    }

    fn token_request_expired(&mut self) {
        self.token_deadline = None;
        tracing::warn!("No pairing token received");
        self.emit(ClientEvent::PairTokenTimeout);
    }

    async fn handle_relay_input(&mut self, input: RelayInput) -> Result<(), ClientError> {
        if input.generation != self.generation {
            return Ok(());
        }
        match input.frame {
            Ok(text) => match ServerMessage::parse(&text) {
                Ok(msg) => self.handle_server_message(msg).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed relay frame");
                    Ok(())
                }
            },
            Err(e) => {
                self.stop_reader();
                self.relay_event(RelayEvent::ConnectionLost {
                    reason: e.to_string(),
                })
                .await;
                Ok(())
            }
        }
    }

    /// Handle one message from the relay.
    pub async fn handle_server_message(&mut self, msg: ServerMessage) -> Result<(), ClientError> {
        match msg {
            ServerMessage::Registered { device_id } => {
                tracing::debug!(%device_id, "Registration accepted");
                self.relay_event(RelayEvent::RegistrationAccepted).await;
            }
            ServerMessage::Error { error } => {
                tracing::warn!(%error, "Relay rejected a request");
            }
            ServerMessage::PairToken { token, expires_at } => {
                self.token_deadline = None;
                self.handshake.hold(token.clone());
                self.emit(ClientEvent::PairTokenIssued { token, expires_at });
            }
            ServerMessage::PairSuccess { peer } => self.on_pair_success(peer).await?,
            ServerMessage::PairFailed { error } => {
                tracing::info!(?error, "Pairing refused");
                self.handshake.clear();
                self.emit(ClientEvent::PairFailed { reason: error });
            }
            ServerMessage::Signal { from, payload } => self.handle_signal(from, payload).await?,
            ServerMessage::SignalFailed { error, to } => {
                tracing::debug!(?error, %to, "Signal not delivered");
                self.emit(ClientEvent::SignalFailed { to });
            }
            ServerMessage::Unpaired { peer_id } => {
                if self.forget_peer(&peer_id).await? {
                    self.emit(ClientEvent::Unpaired { peer: peer_id });
                }
            }
            ServerMessage::PresenceList { devices } => {
                for entry in devices {
                    self.on_presence_entry(entry).await?;
                }
            }
            ServerMessage::Presence {
                device_id,
                status,
                ts,
            } => {
                let online = status == PresenceStatus::Online;
                let status = if online {
                    DeviceStatus::Online
                } else {
                    DeviceStatus::Offline
                };
                self.store
                    .set_device_status(&device_id, status, Some(ts))
                    .await?;
                self.emit(ClientEvent::PresenceChanged {
                    peer: device_id.clone(),
                    online,
                });
                if online {
                    self.refresh_peer(&device_id).await;
                }
            }
            ServerMessage::DeviceInfo {
                device_id, name, ..
            } => {
                // The authenticated key only arrives through pair_key
                let now = now_ms();
                let mut device = Device::paired(device_id, name, "", now);
                device.status = DeviceStatus::Online;
                device.last_seen = Some(now);
                self.store.upsert_device(&device).await?;
            }
        }
        Ok(())
    }

    // ===========================================
    // Pairing
    // ===========================================

    async fn on_pair_success(&mut self, peer: PeerInfo) -> Result<(), ClientError> {
        let now = now_ms();
        let public_key = if self.handshake.is_holding() {
            String::new()
        } else {
            peer.public_key.clone().unwrap_or_default()
        };
        let name = peer
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN_NAME.to_string());
        let mut device = Device::paired(peer.device_id.clone(), name, public_key, now);
        device.status = DeviceStatus::Online;
        device.last_seen = Some(now);
        self.store.upsert_device(&device).await?;
        tracing::info!(peer = %peer.device_id, "Paired");

        if let Some(sealed) = self.handshake.seal_for_peer(&self.identity.public_key)? {
            self.send_signal(&peer.device_id, SignalPayload::PairKey { data: sealed })
                .await?;
        }
        self.emit(ClientEvent::PairSucceeded {
            peer: peer.device_id.clone(),
            name: peer.name,
        });
        self.refresh_peer(&peer.device_id).await;
        Ok(())
    }

    async fn on_presence_entry(&mut self, entry: PresenceEntry) -> Result<(), ClientError> {
        let status = if entry.online {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        };
        let known = self.store.get_device(&entry.device_id).await?.is_some();
        if known && !entry.online {
            // Offline entries carry a placeholder name
            self.store
                .set_device_status(&entry.device_id, status, entry.last_seen)
                .await?;
        } else {
            let mut device = Device::paired(entry.device_id.clone(), entry.name, "", now_ms());
            device.status = status;
            device.last_seen = entry.last_seen;
            self.store.upsert_device(&device).await?;
        }

        self.emit(ClientEvent::PresenceChanged {
            peer: entry.device_id.clone(),
            online: entry.online,
        });
        if entry.online {
            self.refresh_peer(&entry.device_id).await;
        }
        Ok(())
    }

    /// Forget a peer locally. Returns whether anything was known about it.
    async fn forget_peer(&mut self, peer: &DeviceId) -> Result<bool, ClientError> {
        let known = self.store.get_device(peer).await?.is_some();
        let had_record = self.peers.remove(peer);
        self.engine.discard_peer(peer);
        self.store.remove_device(peer).await?;
        Ok(known || had_record)
    }

    // ===========================================
    // Peer negotiation
    // ===========================================

    async fn handle_signal(&mut self, from: DeviceId, payload: Value) -> Result<(), ClientError> {
        let payload = match SignalPayload::from_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(%from, error = %e, "Dropping malformed signal");
                return Ok(());
            }
        };

        match payload {
            SignalPayload::PairKey { data } => {
                let Some(public_key) = self.handshake.accept_key(&data) else {
                    return Ok(());
                };
                let device = match self.store.get_device(&from).await? {
                    Some(mut device) => {
                        device.public_key = public_key;
                        device
                    }
                    None => Device::paired(from.clone(), UNKNOWN_NAME, public_key, now_ms()),
                };
                self.store.upsert_device(&device).await?;
                tracing::info!(peer = %from, "Received peer public key");
                self.emit(ClientEvent::PeerKeyReceived { peer: from });
            }
            SignalPayload::Offer { sdp } => {
                self.ensure_if_absent(&from).await;
                let actions = self.peers.apply(&from, PeerEvent::OfferReceived);
                self.run_peer_actions(&from, actions, Some(sdp)).await;
            }
            SignalPayload::Answer { sdp } => {
                if self.ensure_if_absent(&from).await {
                    tracing::debug!(peer = %from, "Dropping answer for a discarded offer");
                    return Ok(());
                }
                let actions = self.peers.apply(&from, PeerEvent::AnswerReceived);
                self.run_peer_actions(&from, actions, Some(sdp)).await;
            }
            SignalPayload::Ice { candidate } => {
                self.ensure_if_absent(&from).await;
                let actions = self.peers.apply(&from, PeerEvent::RemoteCandidate);
                self.run_peer_actions(&from, actions, Some(candidate)).await;
            }
        }
        Ok(())
    }

    /// Start negotiating with an absent peer. Returns whether it was absent.
    async fn ensure_if_absent(&mut self, peer: &DeviceId) -> bool {
        if !self.peers.state(peer).is_absent() {
            return false;
        }
        let actions = self.peers.ensure(peer);
        self.run_peer_actions(peer, actions, None).await;
        true
    }

    /// Make sure a negotiation is running toward a reachable peer.
    ///
    /// A connected peer is left alone; an attempt that never opened is
    /// restarted, since the other side may have lost its half.
    async fn refresh_peer(&mut self, peer: &DeviceId) {
        if let PeerState::Connecting(_) = self.peers.state(peer) {
            tracing::debug!(peer = %peer, "Restarting stalled negotiation");
            self.teardown(peer);
        }
        let actions = self.peers.ensure(peer);
        self.run_peer_actions(peer, actions, None).await;
    }

    async fn run_peer_actions(
        &mut self,
        peer: &DeviceId,
        actions: Vec<PeerAction>,
        data: Option<Value>,
    ) {
        for action in actions {
            let Err(e) = self.run_peer_action(peer, action, data.clone()).await else {
                continue;
            };
            tracing::warn!(peer = %peer, ?action, error = %e, "Peer action failed");
            if matches!(e, ClientError::Link(_)) {
                let follow = self.peers.apply(peer, PeerEvent::LinkFailed);
                if follow.contains(&PeerAction::Teardown) {
                    self.teardown(peer);
                }
                return;
            }
        }
    }

    async fn run_peer_action(
        &mut self,
        peer: &DeviceId,
        action: PeerAction,
        data: Option<Value>,
    ) -> Result<(), ClientError> {
        match action {
            PeerAction::OpenLink { role } => {
                let link = self.negotiator.open(peer, role, self.link_tx.clone()).await?;
                self.peers.attach_link(peer, link);
            }
            PeerAction::SendOffer => {
                let sdp = self.require_link(peer)?.create_offer().await?;
                self.send_signal(peer, SignalPayload::Offer { sdp }).await?;
            }
            PeerAction::SendAnswer => {
                let offer = data.unwrap_or(Value::Null);
                let sdp = self.require_link(peer)?.accept_offer(offer).await?;
                self.send_signal(peer, SignalPayload::Answer { sdp }).await?;
            }
            PeerAction::ApplyAnswer => {
                let answer = data.unwrap_or(Value::Null);
                self.require_link(peer)?.accept_answer(answer).await?;
            }
            PeerAction::AddRemoteCandidate => {
                let candidate = data.unwrap_or(Value::Null);
                self.require_link(peer)?.add_candidate(candidate).await?;
            }
            PeerAction::RelayLocalCandidate => {
                if let Some(candidate) = data {
                    self.send_signal(peer, SignalPayload::Ice { candidate })
                        .await?;
                }
            }
            PeerAction::StartSync => {
                let link = self.require_link(peer)?;
                self.engine.flush_peer(peer, link).await?;
                link.send(&ChannelMessage::SyncRequest {}.to_json()?)?;
            }
            PeerAction::Teardown => self.teardown(peer),
        }
        Ok(())
    }

    fn require_link(&self, peer: &DeviceId) -> Result<&dyn PeerLink, ClientError> {
        self.peers
            .link(peer)
            .ok_or(ClientError::Link(LinkError::NotOpen))
    }

    fn teardown(&mut self, peer: &DeviceId) {
        self.peers.remove(peer);
        self.engine.discard_peer(peer);
    }

    /// Handle one event from a peer link.
    pub async fn handle_link_event(&mut self, event: LinkEvent) -> Result<(), ClientError> {
        match event {
            LinkEvent::LocalCandidate { peer, candidate } => {
                let actions = self.peers.apply(&peer, PeerEvent::LocalCandidate);
                self.run_peer_actions(&peer, actions, Some(candidate)).await;
            }
            LinkEvent::ChannelOpen { peer } => {
                tracing::info!(peer = %peer, "Peer channel open");
                let actions = self.peers.apply(&peer, PeerEvent::ChannelOpened);
                self.run_peer_actions(&peer, actions, None).await;
            }
            LinkEvent::ChannelMessage { peer, text } => {
                if !self.peers.is_connected(&peer) {
                    tracing::debug!(peer = %peer, "Dropping message from unopened channel");
                    return Ok(());
                }
                let Some(link) = self.peers.link(&peer) else {
                    return Ok(());
                };
                let inbound = self.engine.receive(&peer, &text, link).await?;
                if let Inbound::Applied { item, .. } = inbound {
                    self.emit(ClientEvent::ItemReceived { from: peer, item });
                }
            }
            LinkEvent::StateChanged { peer, state } => {
                if state.is_terminal() {
                    tracing::info!(peer = %peer, ?state, "Peer link ended");
                    let actions = self.peers.apply(&peer, PeerEvent::LinkFailed);
                    self.run_peer_actions(&peer, actions, None).await;
                } else {
                    tracing::debug!(peer = %peer, ?state, "Peer link state");
                }
            }
        }
        Ok(())
    }

    // ===========================================
    // Commands and timers
    // ===========================================

    /// Handle one application command. Returns false once shut down.
    pub async fn handle_command(&mut self, command: Command) -> Result<bool, ClientError> {
        match command {
            Command::RequestPairToken => {
                if self.relay.is_registered() {
                    self.send_token_request().await;
                } else {
                    self.pending_token_request = true;
                    if self.relay == RelayLinkState::Disconnected {
                        self.connect().await;
                    }
                }
            }
            Command::PairWithToken { token } => {
                let token = token.trim().to_string();
                self.handshake.hold(token.clone());
                self.send_relay(&ClientMessage::PairWithToken { token }).await;
            }
            Command::Unpair { peer } => {
                self.send_relay(&ClientMessage::Unpair {
                    peer_id: peer.clone(),
                })
                .await;
                if self.forget_peer(&peer).await? {
                    self.emit(ClientEvent::Unpaired { peer });
                }
            }
            Command::Rename { name } => {
                self.identity_provider.rename(&name).await?;
                self.identity.name = name;
                if self.relay.is_open() {
                    let register = self.registration();
                    self.send_relay(&register).await;
                }
            }
            Command::Capture { text } => {
                self.capture(text).await?;
            }
            Command::Shutdown => {
                self.shutdown().await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Record a local copy and send it to every connected peer.
    pub async fn capture(&mut self, text: String) -> Result<Option<ClipboardItem>, ClientError> {
        let Some(item) = self
            .engine
            .capture(&self.identity.device_id, &self.identity.name, text)
            .await?
        else {
            return Ok(None);
        };
        for peer in self.peers.connected_peers() {
            let Some(link) = self.peers.link(&peer) else {
                continue;
            };
            if let Err(e) = self.engine.send_item(&peer, link, &item).await {
                tracing::warn!(peer = %peer, error = %e, "Broadcast failed");
            }
        }
        Ok(Some(item))
    }

    /// Resend pending items to every connected peer and drop stalled
    /// partial items.
    pub async fn flush(&mut self) -> Result<(), ClientError> {
        self.engine.purge_stale(now_ms());
        for peer in self.peers.connected_peers() {
            let Some(link) = self.peers.link(&peer) else {
                continue;
            };
            if let Err(e) = self.engine.flush_peer(&peer, link).await {
                tracing::warn!(peer = %peer, error = %e, "Flush failed");
            }
        }
        Ok(())
    }

    /// Send a heartbeat if registered.
    pub async fn heartbeat(&mut self) {
        if self.relay.is_registered() {
            self.send_relay(&ClientMessage::Heartbeat {}).await;
        }
    }

    async fn poll_clipboard(&mut self) -> Result<(), ClientError> {
        if let Some(text) = self.engine.poll_clipboard().await? {
            self.capture(text).await?;
        }
        Ok(())
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl<T: Transport + 'static> Drop for ClipClient<T> {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;
    use crate::identity::SettingsIdentity;
    use crate::link::LoopbackHub;
    use crate::store::{MemoryStore, DEVICE_ID, DEVICE_NAME};
    use crate::transport::MockTransport;
    use sync_types::{ClipboardContent, PendingStatus};

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s)
    }

    struct TestDevice {
        id: DeviceId,
        client: ClipClient<MockTransport>,
        transport: MockTransport,
        store: Arc<MemoryStore>,
        clipboard: MemoryClipboard,
        events: broadcast::Receiver<ClientEvent>,
    }

    impl TestDevice {
        fn sent(&self) -> Vec<ClientMessage> {
            self.transport
                .take_sent()
                .iter()
                .map(|frame| ClientMessage::parse(frame).unwrap())
                .collect()
        }

        fn events(&mut self) -> Vec<ClientEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        async fn pump_links(&mut self) -> usize {
            let mut handled = 0;
            loop {
                let event = self
                    .client
                    .inputs
                    .as_mut()
                    .and_then(|inputs| inputs.link_events.try_recv().ok());
                let Some(event) = event else {
                    return handled;
                };
                self.client.handle_link_event(event).await.unwrap();
                handled += 1;
            }
        }

        async fn register(&mut self) {
            self.client.connect().await;
            self.client
                .handle_server_message(ServerMessage::Registered {
                    device_id: self.id.clone(),
                })
                .await
                .unwrap();
        }

        async fn paired_with(&mut self, peer: &str) {
            self.client
                .handle_server_message(ServerMessage::PairSuccess {
                    peer: PeerInfo {
                        device_id: id(peer),
                        name: Some(format!("Device {peer}")),
                        public_key: Some(format!("pk-{peer}")),
                    },
                })
                .await
                .unwrap();
        }
    }

    async fn device(name: &str, hub: &LoopbackHub) -> TestDevice {
        let store = Arc::new(MemoryStore::new());
        store.set_setting(DEVICE_ID, name).await.unwrap();
        store
            .set_setting(DEVICE_NAME, &format!("Device {name}"))
            .await
            .unwrap();
        let clipboard = MemoryClipboard::new();
        let transport = MockTransport::new();
        let (client, _handle) = ClipClient::new(
            ClientConfig::default().with_relay_url("ws://relay.test"),
            transport.clone(),
            Arc::new(hub.negotiator(id(name))),
            store.clone(),
            Arc::new(clipboard.clone()),
            Arc::new(SettingsIdentity::new(store.clone())),
        )
        .await
        .unwrap();
        let events = client.subscribe();
        TestDevice {
            id: id(name),
            client,
            transport,
            store,
            clipboard,
            events,
        }
    }

    /// Deliver `from`'s relayed signals to `to`. Other frames are discarded.
    async fn forward_signals(from: &mut TestDevice, to: &mut TestDevice) -> usize {
        let mut delivered = 0;
        for msg in from.sent() {
            if let ClientMessage::Signal { to: target, payload } = msg {
                assert_eq!(target, to.id);
                to.client
                    .handle_server_message(ServerMessage::Signal {
                        from: from.id.clone(),
                        payload,
                    })
                    .await
                    .unwrap();
                delivered += 1;
            }
        }
        delivered
    }

    /// Relay signals and link events until both sides are quiet.
    async fn settle(a: &mut TestDevice, b: &mut TestDevice) {
        for _ in 0..32 {
            let moved = forward_signals(a, b).await
                + forward_signals(b, a).await
                + a.pump_links().await
                + b.pump_links().await;
            if moved == 0 {
                return;
            }
        }
        panic!("devices did not settle");
    }

    // ===========================================
    // Relay link
    // ===========================================

    #[tokio::test]
    async fn connect_registers_then_requests_presence() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;

        a.client.connect().await;
        assert_eq!(a.transport.connected_address().as_deref(), Some("ws://relay.test"));
        let public_key = a.client.identity().public_key.clone();
        assert_eq!(
            a.sent(),
            vec![ClientMessage::Register {
                device_id: Some("a".into()),
                name: Some("Device a".into()),
                public_key: Some(public_key),
            }]
        );

        a.client
            .handle_server_message(ServerMessage::Registered { device_id: id("a") })
            .await
            .unwrap();
        assert!(a.client.relay_state().is_registered());
        assert_eq!(a.sent(), vec![ClientMessage::RequestPresence {}]);
        assert_eq!(
            a.events(),
            vec![ClientEvent::Registered { device_id: id("a") }]
        );
    }

    #[tokio::test]
    async fn connect_failure_schedules_reconnect() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.transport.fail_next_connect("refused");

        a.client.connect().await;
        assert_eq!(
            a.client.relay_state(),
            RelayLinkState::Reconnecting { attempt: 1 }
        );
        assert!(a.client.reconnect_at.is_some());

        // A second refusal backs off further instead of starting over
        a.transport.fail_next_connect("refused");
        a.client.reconnect_at = None;
        a.client.relay_event(RelayEvent::ReconnectTimer).await;
        assert_eq!(
            a.client.relay_state(),
            RelayLinkState::Reconnecting { attempt: 2 }
        );
        let delay = a.client.reconnect_at.unwrap() - Instant::now();
        assert!(delay > std::time::Duration::from_secs(3));

        a.client.relay_event(RelayEvent::ReconnectTimer).await;
        assert_eq!(a.client.relay_state(), RelayLinkState::Registering);
    }

    #[tokio::test]
    async fn lost_relay_connection_reports_and_reconnects() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.register().await;
        a.events();

        let generation = a.client.generation;
        a.client
            .handle_relay_input(RelayInput {
                generation,
                frame: Err(TransportError::ConnectionClosed),
            })
            .await
            .unwrap();
        assert_eq!(
            a.client.relay_state(),
            RelayLinkState::Reconnecting { attempt: 1 }
        );
        assert!(matches!(
            a.events().as_slice(),
            [ClientEvent::RelayDisconnected { .. }]
        ));
    }

    #[tokio::test]
    async fn stale_reader_input_is_ignored() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.register().await;

        a.client
            .handle_relay_input(RelayInput {
                generation: a.client.generation + 7,
                frame: Err(TransportError::ConnectionClosed),
            })
            .await
            .unwrap();
        assert!(a.client.relay_state().is_registered());
    }

    #[tokio::test]
    async fn heartbeat_only_when_registered() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.client.connect().await;
        a.sent();
        a.client.heartbeat().await;
        assert!(a.sent().is_empty());

        a.client
            .handle_server_message(ServerMessage::Registered { device_id: id("a") })
            .await
            .unwrap();
        a.sent();
        a.client.heartbeat().await;
        assert_eq!(a.sent(), vec![ClientMessage::Heartbeat {}]);
    }

    #[tokio::test]
    async fn rename_re_registers() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.register().await;
        a.sent();

        a.client
            .handle_command(Command::Rename {
                name: "Kitchen".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            a.sent().as_slice(),
            [ClientMessage::Register { name: Some(name), .. }] if name == "Kitchen"
        ));
        assert_eq!(
            a.store.get_setting(DEVICE_NAME).await.unwrap().as_deref(),
            Some("Kitchen")
        );
    }

    // ===========================================
    // Pairing
    // ===========================================

    #[tokio::test]
    async fn token_request_waits_for_registration() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;

        a.client
            .handle_command(Command::RequestPairToken)
            .await
            .unwrap();
        assert!(matches!(a.sent().as_slice(), [ClientMessage::Register { .. }]));
        assert!(a.client.token_deadline.is_none());

        a.client
            .handle_server_message(ServerMessage::Registered { device_id: id("a") })
            .await
            .unwrap();
        assert_eq!(
            a.sent(),
            vec![
                ClientMessage::RequestPresence {},
                ClientMessage::RequestPairToken {}
            ]
        );
        assert!(a.client.token_deadline.is_some());
    }

    #[tokio::test]
    async fn token_timeout_and_issue() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.register().await;
        a.events();

        a.client
            .handle_command(Command::RequestPairToken)
            .await
            .unwrap();
        a.client.token_request_expired();
        assert_eq!(a.events(), vec![ClientEvent::PairTokenTimeout]);

        a.client
            .handle_server_message(ServerMessage::PairToken {
                token: "T".into(),
                expires_at: 120_000,
            })
            .await
            .unwrap();
        assert!(a.client.token_deadline.is_none());
        assert!(a.client.handshake.is_holding());
        assert_eq!(
            a.events(),
            vec![ClientEvent::PairTokenIssued {
                token: "T".into(),
                expires_at: 120_000
            }]
        );
    }

    #[tokio::test]
    async fn pair_failure_clears_token() {
        let hub = LoopbackHub::new();
        let mut b = device("b", &hub).await;
        b.register().await;
        b.events();

        b.client
            .handle_command(Command::PairWithToken {
                token: " T \n".into(),
            })
            .await
            .unwrap();
        assert!(b.sent().contains(&ClientMessage::PairWithToken { token: "T".into() }));

        b.client
            .handle_server_message(ServerMessage::PairFailed {
                error: PairFailure::TokenInvalidOrExpired,
            })
            .await
            .unwrap();
        assert!(!b.client.handshake.is_holding());
        assert_eq!(
            b.events(),
            vec![ClientEvent::PairFailed {
                reason: PairFailure::TokenInvalidOrExpired
            }]
        );
    }

    #[tokio::test]
    async fn pairing_exchanges_sealed_public_keys() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        let mut b = device("b", &hub).await;
        a.register().await;
        b.register().await;

        a.client
            .handle_command(Command::RequestPairToken)
            .await
            .unwrap();
        a.client
            .handle_server_message(ServerMessage::PairToken {
                token: "T".into(),
                expires_at: 120_000,
            })
            .await
            .unwrap();
        b.client
            .handle_command(Command::PairWithToken { token: "T".into() })
            .await
            .unwrap();
        a.sent();
        b.sent();
        a.events();
        b.events();

        a.paired_with("b").await;
        b.paired_with("a").await;

        // Keys from pair_success are not trusted while a token is held
        let stored = a.store.get_device(&id("b")).await.unwrap().unwrap();
        assert_eq!(stored.public_key, "");
        assert_eq!(stored.name, "Device b");

        settle(&mut a, &mut b).await;

        let a_key = a.client.identity().public_key.clone();
        let b_key = b.client.identity().public_key.clone();
        assert_eq!(
            a.store.get_device(&id("b")).await.unwrap().unwrap().public_key,
            b_key
        );
        assert_eq!(
            b.store.get_device(&id("a")).await.unwrap().unwrap().public_key,
            a_key
        );
        assert!(!a.client.handshake.is_holding());
        assert!(!b.client.handshake.is_holding());
        assert!(a.events().contains(&ClientEvent::PeerKeyReceived { peer: id("b") }));
        assert!(b.events().contains(&ClientEvent::PeerKeyReceived { peer: id("a") }));
    }

    #[tokio::test]
    async fn pair_success_without_token_trusts_relay_key() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.register().await;
        a.sent();
        a.paired_with("b").await;

        let stored = a.store.get_device(&id("b")).await.unwrap().unwrap();
        assert_eq!(stored.public_key, "pk-b");
        assert_eq!(stored.status, DeviceStatus::Online);
        // No token held, so no pair_key; "a" initiates toward "b"
        let sent = a.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            ClientMessage::Signal { to, payload } if to == &id("b") && payload["type"] == "offer"
        ));
    }

    #[tokio::test]
    async fn corrupt_pair_key_is_ignored() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.register().await;
        a.client.handshake.hold("T");
        a.paired_with("b").await;

        let payload = serde_json::json!({
            "type": "pair_key",
            "data": {"iv": "AAAA", "ciphertext": "AAAA", "tag": "AAAA"}
        });
        a.client
            .handle_server_message(ServerMessage::Signal {
                from: id("b"),
                payload,
            })
            .await
            .unwrap();
        assert!(a.client.handshake.is_holding());
        assert_eq!(
            a.store.get_device(&id("b")).await.unwrap().unwrap().public_key,
            ""
        );
    }

    // ===========================================
    // Presence and unpairing
    // ===========================================

    #[tokio::test]
    async fn presence_online_starts_negotiation() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.register().await;
        a.sent();
        a.events();

        a.client
            .handle_server_message(ServerMessage::Presence {
                device_id: id("b"),
                status: PresenceStatus::Online,
                ts: 5_000,
            })
            .await
            .unwrap();
        assert!(!a.client.peers().state(&id("b")).is_absent());
        assert!(matches!(
            a.sent().as_slice(),
            [ClientMessage::Signal { payload, .. }] if payload["type"] == "offer"
        ));
        assert_eq!(
            a.events(),
            vec![ClientEvent::PresenceChanged {
                peer: id("b"),
                online: true
            }]
        );

        // The answerer side only prepares its link
        let mut c = device("c", &hub).await;
        c.register().await;
        c.sent();
        c.client
            .handle_server_message(ServerMessage::Presence {
                device_id: id("a"),
                status: PresenceStatus::Online,
                ts: 5_000,
            })
            .await
            .unwrap();
        assert!(c.sent().is_empty());
        assert!(!c.client.peers().state(&id("a")).is_absent());
    }

    #[tokio::test]
    async fn presence_list_keeps_known_names() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.register().await;
        a.store
            .upsert_device(&Device::paired(id("c"), "Laptop", "pk-c", 1))
            .await
            .unwrap();

        a.client
            .handle_server_message(ServerMessage::PresenceList {
                devices: vec![PresenceEntry {
                    device_id: id("c"),
                    online: false,
                    name: "Unknown".into(),
                    last_seen: None,
                    public_key: None,
                }],
            })
            .await
            .unwrap();
        let c = a.store.get_device(&id("c")).await.unwrap().unwrap();
        assert_eq!(c.name, "Laptop");
        assert_eq!(c.public_key, "pk-c");
        assert_eq!(c.status, DeviceStatus::Offline);
        assert!(a.client.peers().state(&id("c")).is_absent());
    }

    #[tokio::test]
    async fn unpair_removes_everything() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        a.register().await;
        a.paired_with("b").await;
        a.sent();
        a.events();

        a.client
            .handle_command(Command::Unpair { peer: id("b") })
            .await
            .unwrap();
        assert_eq!(
            a.sent(),
            vec![ClientMessage::Unpair { peer_id: id("b") }]
        );
        assert!(a.store.get_device(&id("b")).await.unwrap().is_none());
        assert!(a.client.peers().state(&id("b")).is_absent());
        assert_eq!(a.events(), vec![ClientEvent::Unpaired { peer: id("b") }]);

        // The relay's confirmation for an already forgotten peer is quiet
        a.client
            .handle_server_message(ServerMessage::Unpaired { peer_id: id("b") })
            .await
            .unwrap();
        assert!(a.events().is_empty());
    }

    // ===========================================
    // End to end
    // ===========================================

    #[tokio::test]
    async fn copied_text_reaches_peer_and_is_acked() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        let mut b = device("b", &hub).await;
        a.register().await;
        b.register().await;
        a.paired_with("b").await;
        b.paired_with("a").await;

        let item = a
            .client
            .capture("hello".into())
            .await
            .unwrap()
            .unwrap();
        let entry = a
            .store
            .pending_entry(&id("b"), &item.item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, PendingStatus::Pending);

        settle(&mut a, &mut b).await;

        assert!(a.client.peers().is_connected(&id("b")));
        assert!(b.client.peers().is_connected(&id("a")));
        assert_eq!(b.clipboard.current(), Some(ClipboardContent::text("hello")));
        let received = b.store.get_item(&item.item_id).await.unwrap().unwrap();
        assert_eq!(received.source_device_id, id("a"));
        let entry = a
            .store
            .pending_entry(&id("b"), &item.item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, PendingStatus::Acked);
        assert!(b.events().iter().any(|event| matches!(
            event,
            ClientEvent::ItemReceived { from, item: got } if from == &id("a") && got.payload == "hello"
        )));
    }

    #[tokio::test]
    async fn capture_on_open_channel_is_sent_immediately() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        let mut b = device("b", &hub).await;
        a.register().await;
        b.register().await;
        a.paired_with("b").await;
        b.paired_with("a").await;
        settle(&mut a, &mut b).await;

        b.clipboard.set_text("from b");
        b.client.poll_clipboard().await.unwrap();
        settle(&mut a, &mut b).await;

        assert_eq!(a.clipboard.current(), Some(ClipboardContent::text("from b")));
        // The applied text is not echoed back
        a.client.poll_clipboard().await.unwrap();
        assert_eq!(a.store.list_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn link_failure_tears_down_both_sides() {
        let hub = LoopbackHub::new();
        let mut a = device("a", &hub).await;
        let mut b = device("b", &hub).await;
        a.register().await;
        b.register().await;
        a.paired_with("b").await;
        b.paired_with("a").await;
        settle(&mut a, &mut b).await;
        assert!(a.client.peers().is_connected(&id("b")));

        hub.fail(&id("a"), &id("b"));
        a.pump_links().await;
        b.pump_links().await;
        assert!(a.client.peers().is_empty());
        assert!(b.client.peers().is_empty());

        // Presence brings the pair back
        a.client
            .handle_server_message(ServerMessage::Presence {
                device_id: id("b"),
                status: PresenceStatus::Online,
                ts: 1,
            })
            .await
            .unwrap();
        settle(&mut a, &mut b).await;
        assert!(a.client.peers().is_connected(&id("b")));
        assert!(b.client.peers().is_connected(&id("a")));
    }

    #[tokio::test]
    async fn handle_reports_closed_dispatcher() {
        let hub = LoopbackHub::new();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let (client, handle) = ClipClient::new(
            ClientConfig::default(),
            MockTransport::new(),
            Arc::new(hub.negotiator(id("z"))),
            store.clone(),
            Arc::new(MemoryClipboard::new()),
            Arc::new(SettingsIdentity::new(store)),
        )
        .await
        .unwrap();
        assert!(handle.capture("x").is_ok());
        drop(client);
        assert!(matches!(handle.shutdown(), Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let hub = LoopbackHub::new();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let transport = MockTransport::new();
        transport.fail_next_connect("offline");
        let (client, handle) = ClipClient::new(
            ClientConfig::default(),
            transport,
            Arc::new(hub.negotiator(id("z"))),
            store.clone(),
            Arc::new(MemoryClipboard::new()),
            Arc::new(SettingsIdentity::new(store)),
        )
        .await
        .unwrap();
        let task = tokio::spawn(client.run());
        handle.shutdown().unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
