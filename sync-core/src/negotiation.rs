//! Per-peer connection negotiation state machine.
//!
//! Pure and side-effect free, in the same style as the relay link machine:
//! feed a [`PeerEvent`], get back the next [`PeerState`] plus the
//! [`PeerAction`]s the client must perform. The client owns the actual
//! negotiation backend and the channel.
//!
//! Lifecycle: `Absent → Connecting → Connected`. A terminal link failure
//! from any live state returns the peer to `Absent` with a `Teardown`.

use sync_types::DeviceId;

/// Which side originates the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the channel and the offer.
    Initiator,
    /// Waits for the offer and answers it.
    Answerer,
}

impl Role {
    /// The lexicographically smaller device id initiates.
    ///
    /// Both sides evaluate this with the arguments swapped and always
    /// reach opposite answers, so a pair never has two initiators.
    pub fn for_pair(local: &DeviceId, remote: &DeviceId) -> Self {
        if local < remote {
            Role::Initiator
        } else {
            Role::Answerer
        }
    }
}

/// Offer/answer progress of a live negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No offer outstanding.
    Stable,
    /// A local offer was sent and awaits its answer.
    HaveLocalOffer,
}

/// Negotiation bookkeeping for a peer that is not absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiation {
    /// Our role for this pair.
    pub role: Role,
    /// Offer/answer progress.
    pub signaling: SignalingState,
    /// Whether the remote description has been applied.
    pub remote_described: bool,
}

/// Connection state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No connection attempt.
    #[default]
    Absent,
    /// Negotiating; channel not yet open.
    Connecting(Negotiation),
    /// Channel open.
    Connected(Negotiation),
}

/// Inputs to the peer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// The peer is reachable; start negotiating if nothing is in progress.
    Ensure {
        /// Our role, from [`Role::for_pair`].
        role: Role,
    },
    /// The peer sent an offer.
    OfferReceived,
    /// The peer sent an answer.
    AnswerReceived,
    /// The peer sent a candidate.
    RemoteCandidate,
    /// The backend produced a local candidate.
    LocalCandidate,
    /// The channel opened.
    ChannelOpened,
    /// The link reached failed, disconnected or closed.
    LinkFailed,
}

/// Work the client must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
    /// Create the link; the initiator also creates the channel.
    OpenLink {
        /// Our role.
        role: Role,
    },
    /// Create an offer, set it as local description, relay it.
    SendOffer,
    /// Apply the remote offer, create and set an answer, relay it.
    SendAnswer,
    /// Apply the remote answer.
    ApplyAnswer,
    /// Add the remote candidate to the link.
    AddRemoteCandidate,
    /// Relay the local candidate to the peer.
    RelayLocalCandidate,
    /// Flush the pending queue toward the peer, then send `sync_request`.
    StartSync,
    /// Close the link and forget the peer record.
    Teardown,
}

impl PeerState {
    /// Create a new state machine in the Absent state.
    pub fn new() -> Self {
        Self::Absent
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// Events that do not apply in the current state leave it unchanged and
    /// produce no actions; this covers a double offer, an unexpected answer
    /// and a candidate that arrives before the remote description.
    pub fn on_event(self, event: PeerEvent) -> (Self, Vec<PeerAction>) {
        match (self, event) {
            (Self::Absent, PeerEvent::Ensure { role }) => match role {
                Role::Initiator => (
                    Self::Connecting(Negotiation {
                        role,
                        signaling: SignalingState::HaveLocalOffer,
                        remote_described: false,
                    }),
                    vec![PeerAction::OpenLink { role }, PeerAction::SendOffer],
                ),
                Role::Answerer => (
                    Self::Connecting(Negotiation {
                        role,
                        signaling: SignalingState::Stable,
                        remote_described: false,
                    }),
                    vec![PeerAction::OpenLink { role }],
                ),
            },
            (Self::Absent, _) => (Self::Absent, vec![]),

            (_, PeerEvent::LinkFailed) => (Self::Absent, vec![PeerAction::Teardown]),

            (Self::Connecting(n), PeerEvent::ChannelOpened) => {
                (Self::Connected(n), vec![PeerAction::StartSync])
            }

            (state, PeerEvent::OfferReceived) => match state.negotiation() {
                Some(n) if n.signaling == SignalingState::Stable => (
                    state.with(Negotiation {
                        remote_described: true,
                        ..n
                    }),
                    vec![PeerAction::SendAnswer],
                ),
                _ => (state, vec![]),
            },

            (state, PeerEvent::AnswerReceived) => match state.negotiation() {
                Some(n) if n.signaling == SignalingState::HaveLocalOffer => (
                    state.with(Negotiation {
                        signaling: SignalingState::Stable,
                        remote_described: true,
                        ..n
                    }),
                    vec![PeerAction::ApplyAnswer],
                ),
                _ => (state, vec![]),
            },

            (state, PeerEvent::RemoteCandidate) => match state.negotiation() {
                Some(n) if n.remote_described => (state, vec![PeerAction::AddRemoteCandidate]),
                _ => (state, vec![]),
            },

            (state, PeerEvent::LocalCandidate) => (state, vec![PeerAction::RelayLocalCandidate]),

            // Ensure while live, duplicate channel open
            (state, _) => (state, vec![]),
        }
    }

    /// Negotiation bookkeeping, if the peer is not absent.
    pub fn negotiation(&self) -> Option<Negotiation> {
        match self {
            Self::Absent => None,
            Self::Connecting(n) | Self::Connected(n) => Some(*n),
        }
    }

    fn with(self, n: Negotiation) -> Self {
        match self {
            Self::Absent => Self::Absent,
            Self::Connecting(_) => Self::Connecting(n),
            Self::Connected(_) => Self::Connected(n),
        }
    }

    /// Check if the channel is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// Check if there is no connection attempt.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}
