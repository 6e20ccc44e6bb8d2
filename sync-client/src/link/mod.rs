//! Peer link abstraction.
//!
//! Negotiating a direct channel (offer/answer/candidates) is an external
//! capability. A [`Negotiator`] creates one [`PeerLink`] per peer; each link
//! reports what happens to it as [`LinkEvent`]s on the dispatcher's queue,
//! tagged with the peer id.

mod loopback;

pub use loopback::{LoopbackHub, LoopbackNegotiator};

use async_trait::async_trait;
use serde_json::Value;
use sync_core::Role;
use sync_types::DeviceId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Link errors.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Negotiation step failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The channel is not open.
    #[error("channel not open")]
    NotOpen,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Connection state reported by a link backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Negotiation in progress.
    Connecting,
    /// Transport established.
    Connected,
    /// Transport failed.
    Failed,
    /// Transport lost.
    Disconnected,
    /// Closed by either side.
    Closed,
}

impl LinkState {
    /// Whether this state ends the link.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected | Self::Closed)
    }
}

/// Something happened on a peer link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The backend produced a local candidate to relay.
    LocalCandidate {
        /// Remote peer of the link.
        peer: DeviceId,
        /// Opaque candidate.
        candidate: Value,
    },
    /// The data channel opened.
    ChannelOpen {
        /// Remote peer of the link.
        peer: DeviceId,
    },
    /// A text message arrived on the data channel.
    ChannelMessage {
        /// Remote peer of the link.
        peer: DeviceId,
        /// Raw message text.
        text: String,
    },
    /// The link changed state.
    StateChanged {
        /// Remote peer of the link.
        peer: DeviceId,
        /// New state.
        state: LinkState,
    },
}

impl LinkEvent {
    /// The peer this event concerns.
    pub fn peer(&self) -> &DeviceId {
        match self {
            Self::LocalCandidate { peer, .. }
            | Self::ChannelOpen { peer }
            | Self::ChannelMessage { peer, .. }
            | Self::StateChanged { peer, .. } => peer,
        }
    }
}

/// Creates links toward peers.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Create a link toward `peer`. Events are sent on `events`.
    async fn open(
        &self,
        peer: &DeviceId,
        role: Role,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn PeerLink>, LinkError>;
}

/// One negotiated link toward a peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create an offer and set it as the local description.
    async fn create_offer(&self) -> Result<Value, LinkError>;

    /// Apply a remote offer, then create and set the answer.
    async fn accept_offer(&self, offer: Value) -> Result<Value, LinkError>;

    /// Apply the remote answer.
    async fn accept_answer(&self, answer: Value) -> Result<(), LinkError>;

    /// Add a remote candidate.
    async fn add_candidate(&self, candidate: Value) -> Result<(), LinkError>;

    /// Send one text message on the data channel.
    fn send(&self, text: &str) -> Result<(), LinkError>;

    /// Close the link.
    fn close(&self);
}
