//! Per-connection WebSocket session.
//!
//! A session pumps frames between one socket and the coordinator. It never
//! inspects messages itself: inbound text goes to the coordinator verbatim
//! and outbound messages come back on the connection's own queue.

use crate::server::{Command, RelayHandle};
use crate::state::Outbound;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use sync_types::WireMessage;
use tokio::sync::mpsc;

/// Upgrade handler mounted on `/` and `/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, Extension(relay): Extension<RelayHandle>) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, relay))
}

/// Run one session until either side closes.
pub async fn run_session(socket: WebSocket, relay: RelayHandle) {
    let conn = relay.next_connection_id();
    let (tx, mut outbound) = mpsc::unbounded_channel();
    if relay.send(Command::Open { conn, outbound: tx }).is_err() {
        tracing::error!("Dropping {}: coordinator unavailable", conn);
        return;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!("Socket error on {}: {}", conn, e);
                        break;
                    }
                };
                if relay.send(Command::Frame { conn, text }).is_err() {
                    break;
                }
            }
            out = outbound.recv() => match out {
                Some(Outbound::Message(message)) => {
                    let json = match message.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!("Failed to encode reply for {}: {}", conn, e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    let _ = relay.send(Command::Close { conn });
}
