//! # sync-relay
//!
//! Signaling relay for Clipmesh.
//!
//! The relay never sees clipboard contents. It:
//! - Registers devices by id over a WebSocket
//! - Issues single-use pairing tokens and records pairings
//! - Forwards opaque signaling payloads between devices
//! - Tells paired devices when each other come and go
//!
//! ## Architecture
//!
//! ```text
//! Device A ──┐   WebSocket (JSON)   ┌── Device B
//!            │                      │
//!        ┌───┴──────────────────────┴───┐
//!        │  session tasks (one/socket)  │
//!        │              │               │
//!        │        coordinator task      │
//!        │   registry · pairs · tokens  │
//!        └──────────────────────────────┘
//! ```
//!
//! Session tasks only move frames. Every state change happens on the
//! coordinator, in arrival order.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod server;
pub mod session;
pub mod state;

pub use server::{serve, serve_listener, RelayHandle};
