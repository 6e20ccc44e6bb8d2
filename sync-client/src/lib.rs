//! # sync-client
//!
//! Device runtime for the Clipmesh clipboard pairing and sync protocol.
//!
//! This is the library that applications embed on every device.
//!
//! ## Features
//!
//! - **Token Pairing**: relay-issued single-use tokens, with public keys
//!   exchanged under XChaCha20-Poly1305 keyed from the token
//! - **Direct Peer Channels**: offer/answer negotiation relayed as opaque
//!   signals, behind a pluggable [`Negotiator`]
//! - **At-Least-Once Delivery**: a persistent per-peer pending queue,
//!   flushed on channel open and on a timer until acked
//! - **Pure State Machines**: uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sync_client::{ClientConfig, ClipClient, MemoryClipboard, SettingsIdentity,
//!                   SqliteStore, WebSocketTransport};
//!
//! let store = Arc::new(SqliteStore::open("clipmesh.db".as_ref()).await?);
//! let (client, handle) = ClipClient::new(
//!     ClientConfig::default(),
//!     WebSocketTransport::new(),
//!     negotiator,
//!     store.clone(),
//!     Arc::new(MemoryClipboard::new()),
//!     Arc::new(SettingsIdentity::new(store)),
//! )
//! .await?;
//! tokio::spawn(client.run());
//!
//! // Show a token on this device, enter it on the other one
//! handle.request_pair_token()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod clipboard;
pub mod config;
pub mod crypto;
pub mod handshake;
pub mod identity;
pub mod link;
pub mod peers;
pub mod store;
pub mod sync;
pub mod transport;

pub use client::{ClientError, ClientEvent, ClientHandle, ClipClient, Command};
pub use clipboard::{ClipboardAdapter, ClipboardError, ClipboardWatcher, MemoryClipboard};
pub use config::{ClientConfig, ConfigError};
pub use crypto::{CryptoError, PairingKey, KEY_SIZE, NONCE_SIZE};
pub use handshake::Handshake;
pub use identity::{Identity, IdentityError, IdentityProvider, SettingsIdentity};
pub use link::{
    LinkError, LinkEvent, LinkState, LoopbackHub, LoopbackNegotiator, Negotiator, PeerLink,
};
pub use peers::{PeerManager, PeerRecord};
pub use store::{ItemStore, MemoryStore, SqliteStore, StoreError, SyncSettings};
pub use sync::{Inbound, SyncEngine};
pub use transport::{MockTransport, Transport, TransportError, WebSocketTransport};
