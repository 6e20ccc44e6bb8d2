//! Relay link state machine for Clipmesh.
//!
//! This module provides a pure, side-effect-free state machine for the
//! client's connection to the signaling relay. The state machine takes
//! events as input and produces a new state plus a list of actions to
//! execute.
//!
//! The actual I/O (opening the socket, sending `register`) is performed by
//! sync-client, not by this module.

use std::time::Duration;

/// Relay link state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayLinkState {
    /// Not connected to the relay.
    #[default]
    Disconnected,
    /// Socket connection in progress.
    Connecting {
        /// Failed attempts since the link was last registered.
        attempt: u32,
    },
    /// Socket open, `register` sent, waiting for `registered`.
    Registering,
    /// Registered; relay requests are accepted.
    Registered,
    /// Disconnected, waiting to reconnect.
    Reconnecting {
        /// Number of reconnection attempts so far.
        attempt: u32,
    },
}

impl RelayLinkState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: RelayEvent) -> (Self, Vec<RelayAction>) {
        match (self, event) {
            (Self::Disconnected, RelayEvent::ConnectRequested) => {
                (Self::Connecting { attempt: 0 }, vec![RelayAction::Connect])
            }

            (Self::Connecting { .. } | Self::Reconnecting { .. }, RelayEvent::ConnectSucceeded) => {
                (Self::Registering, vec![RelayAction::SendRegistration])
            }
            (
                Self::Connecting { attempt } | Self::Reconnecting { attempt },
                RelayEvent::ConnectFailed { error },
            ) => {
                let next_attempt = attempt.saturating_add(1);
                let status = if attempt == 0 {
                    RelayStatus::ConnectionFailed { error }
                } else {
                    RelayStatus::ReconnectFailed {
                        attempt: next_attempt,
                        error,
                    }
                };
                (
                    Self::Reconnecting {
                        attempt: next_attempt,
                    },
                    vec![
                        RelayAction::EmitEvent(status),
                        RelayAction::StartReconnectTimer {
                            delay: calculate_backoff(next_attempt),
                        },
                    ],
                )
            }

            (Self::Registering, RelayEvent::RegistrationAccepted) => (
                Self::Registered,
                vec![
                    RelayAction::RequestPresence,
                    RelayAction::EmitEvent(RelayStatus::Registered),
                ],
            ),
            // A rename re-registers on a live link
            (Self::Registered, RelayEvent::RegistrationAccepted) => {
                (Self::Registered, vec![RelayAction::RequestPresence])
            }

            (Self::Registering | Self::Registered, RelayEvent::ConnectionLost { reason }) => (
                Self::Reconnecting { attempt: 1 },
                vec![
                    RelayAction::EmitEvent(RelayStatus::Disconnected { reason }),
                    RelayAction::StartReconnectTimer {
                        delay: calculate_backoff(1),
                    },
                ],
            ),
            (Self::Registering | Self::Registered, RelayEvent::DisconnectRequested) => (
                Self::Disconnected,
                vec![
                    RelayAction::Disconnect,
                    RelayAction::EmitEvent(RelayStatus::Disconnected {
                        reason: "user requested".into(),
                    }),
                ],
            ),

            // The attempt count survives the timer so backoff keeps growing
            (Self::Reconnecting { attempt }, RelayEvent::ReconnectTimer) => {
                (Self::Connecting { attempt }, vec![RelayAction::Connect])
            }
            (
                Self::Reconnecting { .. } | Self::Connecting { .. },
                RelayEvent::DisconnectRequested,
            ) => (Self::Disconnected, vec![RelayAction::CancelReconnect]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the socket is open (registered or registering).
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Registering | Self::Registered)
    }

    /// Check if the relay has accepted our registration.
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered)
    }
}

/// Events that can occur in the relay link lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Application asked to connect.
    ConnectRequested,
    /// Socket connection succeeded.
    ConnectSucceeded,
    /// Socket connection failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Relay replied `registered`.
    RegistrationAccepted,
    /// Socket closed or errored.
    ConnectionLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// Application asked to disconnect.
    DisconnectRequested,
    /// Reconnect timer fired.
    ReconnectTimer,
}

/// Actions to be executed by the sync-client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    /// Open the socket.
    Connect,
    /// Close the socket.
    Disconnect,
    /// Send `register` with our identity.
    SendRegistration,
    /// Send `request_presence`.
    RequestPresence,
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Report a status change to the application.
    EmitEvent(RelayStatus),
}

/// Relay link status changes reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    /// Registered with the relay.
    Registered,
    /// First connection attempt failed.
    ConnectionFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Lost the relay connection.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// A reconnection attempt failed.
    ReconnectFailed {
        /// Which reconnection attempt this was.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
}

/// Calculate reconnection backoff with jitter.
///
/// Formula: min(30s, 2^attempt seconds) + random(0..5000ms)
fn calculate_backoff(attempt: u32) -> Duration {
    let base_secs = 2u64.pow(attempt.min(5)).min(30);
    Duration::from_secs(base_secs) + Duration::from_millis(random_jitter_ms())
}

/// Random jitter between 0 and 5000 milliseconds; zero if no entropy.
fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % 5001,
        Err(_) => 0,
    }
}
