//! Relay state: device registry, pairing edges and pairing tokens.
//!
//! [`RelayState`] is owned by exactly one task (the coordinator in
//! [`crate::server`]). Connection tasks never touch it directly; they send
//! commands and receive [`Outbound`] messages on their own queue. Every
//! method takes the current time so the whole protocol can be driven
//! deterministically in tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{TokenError, TokenLedger};
use sync_types::{
    ClientMessage, DeviceId, PairFailure, PeerInfo, PresenceEntry, PresenceStatus, ServerMessage,
    SignalFailure, WireMessage,
};
use tokio::sync::mpsc;

use crate::server::RelayMetrics;

/// Identifies one WebSocket connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Instructions for a connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Write this message to the socket.
    Message(ServerMessage),
    /// Close the socket.
    Close,
}

#[derive(Debug)]
struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    device: Option<DeviceId>,
}

#[derive(Debug, Clone)]
struct Registration {
    connection: ConnectionId,
    name: String,
    public_key: String,
    last_seen: u64,
}

/// All relay state, held in memory for the process lifetime.
#[derive(Debug)]
pub struct RelayState {
    connections: HashMap<ConnectionId, Connection>,
    devices: HashMap<DeviceId, Registration>,
    pairs: HashMap<DeviceId, HashSet<DeviceId>>,
    tokens: TokenLedger,
    liveness_timeout_ms: u64,
    metrics: Arc<RelayMetrics>,
}

impl RelayState {
    /// Create empty state.
    pub fn new(token_ttl: Duration, liveness_timeout: Duration, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            connections: HashMap::new(),
            devices: HashMap::new(),
            pairs: HashMap::new(),
            tokens: TokenLedger::new(token_ttl),
            liveness_timeout_ms: liveness_timeout.as_millis() as u64,
            metrics,
        }
    }

    /// Track a newly accepted connection.
    pub fn open(&mut self, conn: ConnectionId, outbound: mpsc::UnboundedSender<Outbound>) {
        self.connections.insert(
            conn,
            Connection {
                outbound,
                device: None,
            },
        );
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        self.refresh_gauges();
        tracing::debug!("Connection opened: {} (total: {})", conn, self.connections.len());
    }

    /// Handle one text frame from a connection.
    pub fn handle_frame(&mut self, conn: ConnectionId, text: &str, now: u64) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle(conn, message, now),
            Err(e) => {
                tracing::debug!("Protocol error on {}: {}", conn, e);
                self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                self.send_to_connection(
                    conn,
                    ServerMessage::Error {
                        error: e.code().to_string(),
                    },
                );
            }
        }
    }

    /// Handle one decoded request from a connection.
    pub fn handle(&mut self, conn: ConnectionId, message: ClientMessage, now: u64) {
        if let ClientMessage::Register {
            device_id,
            name,
            public_key,
        } = message
        {
            self.register(conn, device_id, name, public_key, now);
            return;
        }

        let Some(caller) = self.caller(conn) else {
            tracing::debug!("Ignoring request from unregistered {}", conn);
            return;
        };

        match message {
            ClientMessage::Register { .. } => {}
            ClientMessage::Heartbeat {} => {
                if let Some(reg) = self.devices.get_mut(&caller) {
                    reg.last_seen = now;
                }
            }
            ClientMessage::RequestPairToken {} => {
                let issued = self.tokens.issue(caller.clone(), now);
                self.metrics.tokens_issued.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Issued pairing token for {}", caller);
                self.send_to_device(
                    &caller,
                    ServerMessage::PairToken {
                        token: issued.token,
                        expires_at: issued.expires_at,
                    },
                );
            }
            ClientMessage::PairWithToken { token } => self.pair_with_token(&caller, &token, now),
            ClientMessage::Signal { to, payload } => {
                if self.devices.contains_key(&to) {
                    self.metrics.signals_relayed.fetch_add(1, Ordering::Relaxed);
                    self.send_to_device(
                        &to,
                        ServerMessage::Signal {
                            from: caller,
                            payload,
                        },
                    );
                } else {
                    self.metrics.signals_failed.fetch_add(1, Ordering::Relaxed);
                    self.send_to_device(
                        &caller,
                        ServerMessage::SignalFailed {
                            error: SignalFailure::PeerOffline,
                            to,
                        },
                    );
                }
            }
            ClientMessage::Unpair { peer_id } => self.unpair(&caller, peer_id),
            ClientMessage::RequestPresence {} => {
                let devices = self.presence_of_pairs(&caller);
                self.send_to_device(&caller, ServerMessage::PresenceList { devices });
            }
        }
    }

    fn register(
        &mut self,
        conn: ConnectionId,
        device_id: Option<String>,
        name: Option<String>,
        public_key: Option<String>,
        now: u64,
    ) {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
        let (Some(device_id), Some(name), Some(public_key)) =
            (non_empty(device_id), non_empty(name), non_empty(public_key))
        else {
            self.send_to_connection(
                conn,
                ServerMessage::Error {
                    error: "missing_fields".to_string(),
                },
            );
            return;
        };
        let device_id = DeviceId::new(device_id);

        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        let previous = connection.device.replace(device_id.clone());

        // Re-registering this socket under another id releases the old one
        if let Some(old) = previous.filter(|old| *old != device_id) {
            if self.is_bound_to(&old, conn) {
                self.devices.remove(&old);
                self.broadcast_presence(&old, PresenceStatus::Offline, now);
            }
        }

        if let Some(displaced) = self.devices.get(&device_id).map(|r| r.connection) {
            if displaced != conn {
                tracing::debug!("Registration of {} moved from {} to {}", device_id, displaced, conn);
            }
        }
        self.devices.insert(
            device_id.clone(),
            Registration {
                connection: conn,
                name: name.clone(),
                public_key: public_key.clone(),
                last_seen: now,
            },
        );
        self.metrics.registrations_total.fetch_add(1, Ordering::Relaxed);
        self.refresh_gauges();
        tracing::info!("Registered device {} ({}) on {}", device_id, name, conn);

        self.send_to_connection(
            conn,
            ServerMessage::Registered {
                device_id: device_id.clone(),
            },
        );
        self.broadcast_presence(&device_id, PresenceStatus::Online, now);
        for peer in self.paired_with(&device_id) {
            self.send_to_device(
                &peer,
                ServerMessage::DeviceInfo {
                    device_id: device_id.clone(),
                    name: name.clone(),
                    public_key: public_key.clone(),
                },
            );
        }
    }

    fn pair_with_token(&mut self, caller: &DeviceId, token: &str, now: u64) {
        let owner = match self.tokens.check(token, now) {
            Ok(issued) => issued.owner.clone(),
            Err(e) => {
                let reason = match e {
                    TokenError::Unknown => "unknown",
                    TokenError::Expired => "expired",
                };
                tracing::info!("Pairing refused for {}: {} token", caller, reason);
                return self.pair_failed(caller, PairFailure::TokenInvalidOrExpired);
            }
        };
        if owner == *caller {
            return self.pair_failed(caller, PairFailure::CannotPairSelf);
        }
        if self.is_paired(caller, &owner) {
            return self.pair_failed(caller, PairFailure::AlreadyPaired);
        }
        if self.tokens.consume(token, now).is_err() {
            return self.pair_failed(caller, PairFailure::TokenInvalidOrExpired);
        }

        self.pairs.entry(caller.clone()).or_default().insert(owner.clone());
        self.pairs.entry(owner.clone()).or_default().insert(caller.clone());
        self.metrics.pairings_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Paired {} with {}", caller, owner);

        let owner_info = self.peer_info(&owner);
        let caller_info = self.peer_info(caller);
        self.send_to_device(caller, ServerMessage::PairSuccess { peer: owner_info });
        self.send_to_device(&owner, ServerMessage::PairSuccess { peer: caller_info });
    }

    fn pair_failed(&mut self, caller: &DeviceId, error: PairFailure) {
        self.metrics.pair_failures.fetch_add(1, Ordering::Relaxed);
        self.send_to_device(caller, ServerMessage::PairFailed { error });
    }

    fn unpair(&mut self, caller: &DeviceId, peer: DeviceId) {
        if let Some(set) = self.pairs.get_mut(caller) {
            set.remove(&peer);
        }
        if let Some(set) = self.pairs.get_mut(&peer) {
            set.remove(caller);
        }
        tracing::info!("Unpaired {} from {}", caller, peer);

        self.send_to_device(
            caller,
            ServerMessage::Unpaired {
                peer_id: peer.clone(),
            },
        );
        self.send_to_device(
            &peer,
            ServerMessage::Unpaired {
                peer_id: caller.clone(),
            },
        );
    }

    /// A connection went away (any cause).
    pub fn close(&mut self, conn: ConnectionId, now: u64) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        if let Some(device) = connection.device {
            // A displaced socket closing must not evict the live registration
            if self.is_bound_to(&device, conn) {
                self.devices.remove(&device);
                self.broadcast_presence(&device, PresenceStatus::Offline, now);
                tracing::info!("Device {} disconnected", device);
            }
        }
        self.refresh_gauges();
        tracing::debug!("Connection closed: {} (total: {})", conn, self.connections.len());
    }

    /// Evict every device silent for longer than the liveness timeout.
    ///
    /// Their connections are told to close and their paired peers see them
    /// go offline. Expired pairing tokens are dropped as well. Returns the
    /// evicted device ids.
    pub fn sweep(&mut self, now: u64) -> Vec<DeviceId> {
        let stale: Vec<(DeviceId, ConnectionId)> = self
            .devices
            .iter()
            .filter(|(_, reg)| now.saturating_sub(reg.last_seen) > self.liveness_timeout_ms)
            .map(|(id, reg)| (id.clone(), reg.connection))
            .collect();

        for (device, conn) in &stale {
            self.devices.remove(device);
            if let Some(connection) = self.connections.get_mut(conn) {
                connection.device = None;
                let _ = connection.outbound.send(Outbound::Close);
            }
            self.broadcast_presence(device, PresenceStatus::Offline, now);
            self.metrics.evictions_total.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Evicted silent device {}", device);
        }

        let purged = self.tokens.purge_expired(now);
        if purged > 0 {
            tracing::debug!("Purged {} expired pairing tokens", purged);
        }
        self.refresh_gauges();
        stale.into_iter().map(|(id, _)| id).collect()
    }

    /// Whether `a` and `b` are paired.
    pub fn is_paired(&self, a: &DeviceId, b: &DeviceId) -> bool {
        self.pairs.get(a).is_some_and(|set| set.contains(b))
    }

    /// Devices paired with `device`, sorted.
    pub fn paired_with(&self, device: &DeviceId) -> Vec<DeviceId> {
        let mut peers: Vec<DeviceId> = self
            .pairs
            .get(device)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Whether `device` is currently registered.
    pub fn is_online(&self, device: &DeviceId) -> bool {
        self.devices.contains_key(device)
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of registered devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn caller(&self, conn: ConnectionId) -> Option<DeviceId> {
        let device = self.connections.get(&conn)?.device.clone()?;
        self.is_bound_to(&device, conn).then_some(device)
    }

    fn is_bound_to(&self, device: &DeviceId, conn: ConnectionId) -> bool {
        self.devices
            .get(device)
            .is_some_and(|reg| reg.connection == conn)
    }

    fn peer_info(&self, device: &DeviceId) -> PeerInfo {
        let reg = self.devices.get(device);
        PeerInfo {
            device_id: device.clone(),
            name: reg.map(|r| r.name.clone()),
            public_key: reg.map(|r| r.public_key.clone()),
        }
    }

    fn presence_of_pairs(&self, device: &DeviceId) -> Vec<PresenceEntry> {
        self.paired_with(device)
            .into_iter()
            .map(|peer| match self.devices.get(&peer) {
                Some(reg) => PresenceEntry {
                    device_id: peer,
                    online: true,
                    name: reg.name.clone(),
                    last_seen: Some(reg.last_seen),
                    public_key: Some(reg.public_key.clone()),
                },
                None => PresenceEntry {
                    device_id: peer,
                    online: false,
                    name: "Unknown".to_string(),
                    last_seen: None,
                    public_key: None,
                },
            })
            .collect()
    }

    fn broadcast_presence(&self, device: &DeviceId, status: PresenceStatus, now: u64) {
        for peer in self.paired_with(device) {
            self.send_to_device(
                &peer,
                ServerMessage::Presence {
                    device_id: device.clone(),
                    status,
                    ts: now,
                },
            );
        }
    }

    fn send_to_device(&self, device: &DeviceId, message: ServerMessage) -> bool {
        match self.devices.get(device) {
            Some(reg) => self.send_to_connection(reg.connection, message),
            None => false,
        }
    }

    fn send_to_connection(&self, conn: ConnectionId, message: ServerMessage) -> bool {
        match self.connections.get(&conn) {
            Some(connection) => connection.outbound.send(Outbound::Message(message)).is_ok(),
            None => false,
        }
    }

    fn refresh_gauges(&self) {
        self.metrics
            .connections_active
            .store(self.connections.len() as u64, Ordering::Relaxed);
        self.metrics
            .devices_online
            .store(self.devices.len() as u64, Ordering::Relaxed);
    }
}
