//! In-process loopback links.
//!
//! Every device in one process shares a [`LoopbackHub`]. Offers and answers
//! are plain JSON markers; once the initiator applies the answer and both
//! ends hold a local and a remote description, the hub opens the channel
//! on both sides and routes messages between them.

use super::{LinkError, LinkEvent, LinkState, Negotiator, PeerLink};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use sync_core::Role;
use sync_types::DeviceId;
use tokio::sync::mpsc;

type EndpointKey = (DeviceId, DeviceId);

#[derive(Debug)]
struct Endpoint {
    id: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    local_described: bool,
    remote_described: bool,
    open: bool,
}

impl Endpoint {
    fn described(&self) -> bool {
        self.local_described && self.remote_described
    }
}

#[derive(Debug, Default)]
struct HubInner {
    // Keyed by (owner, remote)
    endpoints: HashMap<EndpointKey, Endpoint>,
}

/// Shared switchboard for loopback links.
#[derive(Debug, Default, Clone)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// A negotiator for `local` attached to this hub.
    pub fn negotiator(&self, local: DeviceId) -> LoopbackNegotiator {
        LoopbackNegotiator {
            hub: self.clone(),
            local,
        }
    }

    /// Report a transport failure to both ends of `a`–`b`.
    pub fn fail(&self, a: &DeviceId, b: &DeviceId) {
        let mut inner = self.lock();
        for (owner, remote) in [(a, b), (b, a)] {
            if let Some(endpoint) = inner.endpoints.get_mut(&(owner.clone(), remote.clone())) {
                endpoint.open = false;
                let _ = endpoint.events.send(LinkEvent::StateChanged {
                    peer: remote.clone(),
                    state: LinkState::Failed,
                });
            }
        }
    }

    /// Whether the channel `owner`→`remote` is open.
    pub fn is_open(&self, owner: &DeviceId, remote: &DeviceId) -> bool {
        self.lock()
            .endpoints
            .get(&(owner.clone(), remote.clone()))
            .is_some_and(|e| e.open)
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Negotiator for one local device.
#[derive(Debug, Clone)]
pub struct LoopbackNegotiator {
    hub: LoopbackHub,
    local: DeviceId,
}

#[async_trait]
impl Negotiator for LoopbackNegotiator {
    async fn open(
        &self,
        peer: &DeviceId,
        _role: Role,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn PeerLink>, LinkError> {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        self.hub.lock().endpoints.insert(
            (self.local.clone(), peer.clone()),
            Endpoint {
                id,
                events,
                local_described: false,
                remote_described: false,
                open: false,
            },
        );
        Ok(Box::new(LoopbackLink {
            hub: self.hub.clone(),
            local: self.local.clone(),
            remote: peer.clone(),
            id,
        }))
    }
}

struct LoopbackLink {
    hub: LoopbackHub,
    local: DeviceId,
    remote: DeviceId,
    id: u64,
}

impl LoopbackLink {
    fn own_key(&self) -> EndpointKey {
        (self.local.clone(), self.remote.clone())
    }

    fn peer_key(&self) -> EndpointKey {
        (self.remote.clone(), self.local.clone())
    }

    fn with_own<R>(
        &self,
        f: impl FnOnce(&mut Endpoint) -> R,
    ) -> Result<R, LinkError> {
        let mut inner = self.hub.lock();
        match inner.endpoints.get_mut(&self.own_key()) {
            Some(endpoint) if endpoint.id == self.id => Ok(f(endpoint)),
            _ => Err(LinkError::Negotiation("link closed".into())),
        }
    }

    fn description(&self, kind: &str) -> Value {
        json!({ "type": kind, "loopback": self.local.as_str() })
    }

    fn emit_candidate(&self) -> Result<(), LinkError> {
        let candidate = json!({ "candidate": format!("loopback {}", self.local) });
        let remote = self.remote.clone();
        self.with_own(|endpoint| {
            let _ = endpoint.events.send(LinkEvent::LocalCandidate {
                peer: remote,
                candidate,
            });
        })
    }

    fn check_kind(description: &Value, kind: &str) -> Result<(), LinkError> {
        if description.get("type").and_then(Value::as_str) == Some(kind) {
            Ok(())
        } else {
            Err(LinkError::Negotiation(format!("expected {kind} description")))
        }
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<Value, LinkError> {
        self.with_own(|endpoint| endpoint.local_described = true)?;
        self.emit_candidate()?;
        Ok(self.description("offer"))
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value, LinkError> {
        Self::check_kind(&offer, "offer")?;
        self.with_own(|endpoint| {
            endpoint.remote_described = true;
            endpoint.local_described = true;
        })?;
        self.emit_candidate()?;
        Ok(self.description("answer"))
    }

    async fn accept_answer(&self, answer: Value) -> Result<(), LinkError> {
        Self::check_kind(&answer, "answer")?;
        self.with_own(|endpoint| endpoint.remote_described = true)?;

        let mut inner = self.hub.lock();
        let ready = |key: &EndpointKey, inner: &HubInner| {
            inner.endpoints.get(key).is_some_and(Endpoint::described)
        };
        if !ready(&self.own_key(), &*inner) || !ready(&self.peer_key(), &*inner) {
            return Ok(());
        }
        for (key, peer) in [
            (self.own_key(), self.remote.clone()),
            (self.peer_key(), self.local.clone()),
        ] {
            if let Some(endpoint) = inner.endpoints.get_mut(&key) {
                endpoint.open = true;
                let _ = endpoint.events.send(LinkEvent::ChannelOpen { peer });
            }
        }
        Ok(())
    }

    async fn add_candidate(&self, _candidate: Value) -> Result<(), LinkError> {
        self.with_own(|_| ())
    }

    fn send(&self, text: &str) -> Result<(), LinkError> {
        let inner = self.hub.lock();
        let own_open = inner
            .endpoints
            .get(&self.own_key())
            .is_some_and(|e| e.id == self.id && e.open);
        let Some(remote) = inner.endpoints.get(&self.peer_key()).filter(|e| e.open) else {
            return Err(LinkError::NotOpen);
        };
        if !own_open {
            return Err(LinkError::NotOpen);
        }
        remote
            .events
            .send(LinkEvent::ChannelMessage {
                peer: self.local.clone(),
                text: text.to_string(),
            })
            .map_err(|_| LinkError::SendFailed("peer dispatcher gone".into()))
    }

    fn close(&self) {
        let mut inner = self.hub.lock();
        let own_key = self.own_key();
        if inner.endpoints.get(&own_key).is_some_and(|e| e.id == self.id) {
            inner.endpoints.remove(&own_key);
        }
        if let Some(remote) = inner.endpoints.get_mut(&self.peer_key()) {
            if remote.open {
                remote.open = false;
                let _ = remote.events.send(LinkEvent::StateChanged {
                    peer: self.local.clone(),
                    state: LinkState::Closed,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    async fn connected_pair(
        hub: &LoopbackHub,
    ) -> (
        Box<dyn PeerLink>,
        mpsc::UnboundedReceiver<LinkEvent>,
        Box<dyn PeerLink>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = hub
            .negotiator(id("a"))
            .open(&id("b"), Role::Initiator, a_tx)
            .await
            .unwrap();
        let b = hub
            .negotiator(id("b"))
            .open(&id("a"), Role::Answerer, b_tx)
            .await
            .unwrap();
        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(offer).await.unwrap();
        a.accept_answer(answer).await.unwrap();
        (a, a_rx, b, b_rx)
    }

    #[tokio::test]
    async fn offer_answer_opens_both_ends() {
        let hub = LoopbackHub::new();
        let (_a, mut a_rx, _b, mut b_rx) = connected_pair(&hub).await;

        let a_events = drain(&mut a_rx);
        assert!(matches!(a_events[0], LinkEvent::LocalCandidate { .. }));
        assert!(a_events.contains(&LinkEvent::ChannelOpen { peer: id("b") }));
        assert!(drain(&mut b_rx).contains(&LinkEvent::ChannelOpen { peer: id("a") }));
        assert!(hub.is_open(&id("a"), &id("b")));
    }

    #[tokio::test]
    async fn messages_are_routed_to_the_other_end() {
        let hub = LoopbackHub::new();
        let (a, _a_rx, b, mut b_rx) = connected_pair(&hub).await;
        drain(&mut b_rx);

        a.send("ping").unwrap();
        assert_eq!(
            drain(&mut b_rx),
            vec![LinkEvent::ChannelMessage {
                peer: id("a"),
                text: "ping".into()
            }]
        );
        drop(b);
    }

    #[tokio::test]
    async fn send_before_open_fails() {
        let hub = LoopbackHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = hub
            .negotiator(id("a"))
            .open(&id("b"), Role::Initiator, tx)
            .await
            .unwrap();
        assert!(matches!(link.send("x"), Err(LinkError::NotOpen)));
    }

    #[tokio::test]
    async fn answer_is_not_an_offer() {
        let hub = LoopbackHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = hub
            .negotiator(id("b"))
            .open(&id("a"), Role::Answerer, tx)
            .await
            .unwrap();
        let result = link.accept_offer(json!({"type": "answer"})).await;
        assert!(matches!(result, Err(LinkError::Negotiation(_))));
    }

    #[tokio::test]
    async fn close_notifies_remote() {
        let hub = LoopbackHub::new();
        let (a, _a_rx, _b, mut b_rx) = connected_pair(&hub).await;
        drain(&mut b_rx);

        a.close();
        assert_eq!(
            drain(&mut b_rx),
            vec![LinkEvent::StateChanged {
                peer: id("a"),
                state: LinkState::Closed
            }]
        );
        assert!(!hub.is_open(&id("b"), &id("a")));
    }

    #[tokio::test]
    async fn fail_reports_to_both_sides() {
        let hub = LoopbackHub::new();
        let (_a, mut a_rx, _b, mut b_rx) = connected_pair(&hub).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        hub.fail(&id("a"), &id("b"));
        assert_eq!(
            drain(&mut a_rx),
            vec![LinkEvent::StateChanged {
                peer: id("b"),
                state: LinkState::Failed
            }]
        );
        assert_eq!(drain(&mut b_rx).len(), 1);
    }
}
