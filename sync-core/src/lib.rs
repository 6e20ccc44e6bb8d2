//! # sync-core
//!
//! Pure logic for Clipmesh (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for pairing and
//! clipboard sync without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input (including the
//! current time) and produce output without side effects. The actual I/O
//! (relay socket, peer channels, storage) is performed by `sync-client` and
//! `sync-relay`, which interpret the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod clock;
pub mod negotiation;
pub mod pairing;
pub mod state;

pub use chunk::{
    frame_item, ChunkError, Reassembler, DEFAULT_CHUNK_THRESHOLD, DEFAULT_PARTIAL_TIMEOUT_MS,
    MAX_PARTIALS_PER_PEER,
};
pub use clock::now_ms;
pub use negotiation::{Negotiation, PeerAction, PeerEvent, PeerState, Role, SignalingState};
pub use pairing::{PairingToken, TokenError, TokenLedger, DEFAULT_TOKEN_TTL};
pub use state::{RelayAction, RelayEvent, RelayLinkState, RelayStatus};
