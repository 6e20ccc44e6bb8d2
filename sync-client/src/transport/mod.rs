//! Relay transport abstraction for Clipmesh.
//!
//! This module provides a pluggable transport for the client's link to the
//! signaling relay (WebSocket in production, mock for testing).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented, carrying JSON text
//! frames:
//! - `connect()` establishes a connection
//! - `send()` transmits one frame
//! - `recv()` receives one frame
//! - `close()` gracefully terminates
//!
//! `send` and `recv` may run concurrently: the client reads on a dedicated
//! task while the dispatcher writes.

mod mock;
mod websocket;

pub use mock::MockTransport;
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

/// Transport for relay protocol frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the relay at `address` (a `ws://` or `wss://` URL).
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Send one text frame.
    async fn send(&self, frame: &str) -> Result<(), TransportError>;

    /// Receive one text frame.
    ///
    /// Blocks until a frame is available or the connection closes.
    async fn recv(&self) -> Result<String, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
