//! Per-peer connection records.
//!
//! One [`PeerRecord`] per remote device, held in a single map. Records are
//! created by the first live transition and destroyed only by
//! [`PeerManager::remove`], which also closes the link.

use crate::link::PeerLink;
use std::collections::HashMap;
use sync_core::{PeerAction, PeerEvent, PeerState, Role};
use sync_types::DeviceId;

/// Connection record for one peer.
#[derive(Default)]
pub struct PeerRecord {
    state: PeerState,
    link: Option<Box<dyn PeerLink>>,
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("state", &self.state)
            .field("has_link", &self.link.is_some())
            .finish()
    }
}

/// All peer records of the local device.
#[derive(Debug)]
pub struct PeerManager {
    local: DeviceId,
    records: HashMap<DeviceId, PeerRecord>,
}

impl PeerManager {
    /// Create an empty manager for `local`.
    pub fn new(local: DeviceId) -> Self {
        Self {
            local,
            records: HashMap::new(),
        }
    }

    /// Our role toward `peer`.
    pub fn role_for(&self, peer: &DeviceId) -> Role {
        Role::for_pair(&self.local, peer)
    }

    /// Current state of `peer`.
    pub fn state(&self, peer: &DeviceId) -> PeerState {
        self.records
            .get(peer)
            .map(|record| record.state)
            .unwrap_or_default()
    }

    /// Start negotiating with `peer` unless something is already in progress.
    pub fn ensure(&mut self, peer: &DeviceId) -> Vec<PeerAction> {
        let role = self.role_for(peer);
        self.apply(peer, PeerEvent::Ensure { role })
    }

    /// Feed one event to the peer's state machine.
    ///
    /// An event that leaves an unknown peer absent creates no record. A
    /// terminal transition keeps the record until the caller executes the
    /// returned `Teardown`.
    pub fn apply(&mut self, peer: &DeviceId, event: PeerEvent) -> Vec<PeerAction> {
        let current = self.state(peer);
        let (next, actions) = current.on_event(event);
        if next != current {
            tracing::debug!(peer = %peer, ?current, ?next, ?event, "Peer transition");
        }
        match self.records.get_mut(peer) {
            Some(record) => record.state = next,
            None if !next.is_absent() => {
                self.records.insert(
                    peer.clone(),
                    PeerRecord {
                        state: next,
                        link: None,
                    },
                );
            }
            None => {}
        }
        actions
    }

    /// Attach the link created for `peer`. Returns false if the record is gone.
    pub fn attach_link(&mut self, peer: &DeviceId, link: Box<dyn PeerLink>) -> bool {
        match self.records.get_mut(peer) {
            Some(record) => {
                if let Some(old) = record.link.replace(link) {
                    old.close();
                }
                true
            }
            None => {
                link.close();
                false
            }
        }
    }

    /// The link toward `peer`, if one exists.
    pub fn link(&self, peer: &DeviceId) -> Option<&dyn PeerLink> {
        self.records.get(peer).and_then(|record| record.link.as_deref())
    }

    /// Close the link and forget the peer.
    pub fn remove(&mut self, peer: &DeviceId) -> bool {
        match self.records.remove(peer) {
            Some(record) => {
                if let Some(link) = record.link {
                    link.close();
                }
                tracing::debug!(peer = %peer, "Peer record removed");
                true
            }
            None => false,
        }
    }

    /// Remove every record.
    pub fn clear(&mut self) {
        let peers: Vec<DeviceId> = self.records.keys().cloned().collect();
        for peer in peers {
            self.remove(&peer);
        }
    }

    /// Peers with an open channel, sorted.
    pub fn connected_peers(&self) -> Vec<DeviceId> {
        let mut peers: Vec<DeviceId> = self
            .records
            .iter()
            .filter(|(_, record)| record.state.is_connected())
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Whether `peer` has an open channel.
    pub fn is_connected(&self, peer: &DeviceId) -> bool {
        self.state(peer).is_connected()
    }

    /// Number of peer records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there are no peer records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
