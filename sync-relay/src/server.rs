//! Relay coordinator and listener.
//!
//! All relay state lives in one [`RelayState`] owned by a single coordinator
//! task. Connection tasks talk to it through a [`RelayHandle`], so requests
//! are applied in arrival order without any locking.

use crate::cleanup::spawn_liveness_sweep;
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::http::{self, health};
use crate::state::{ConnectionId, Outbound, RelayState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sync_core::now_ms;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Operational metrics for monitoring relay activity.
///
/// Counters are monotonically increasing (reset only on restart).
/// Gauges are refreshed by the coordinator after every change.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total WebSocket connections accepted.
    pub connections_total: AtomicU64,
    /// Total successful `register` requests.
    pub registrations_total: AtomicU64,
    /// Total pairing tokens issued.
    pub tokens_issued: AtomicU64,
    /// Total pairings established.
    pub pairings_total: AtomicU64,
    /// Total `pair_failed` replies.
    pub pair_failures: AtomicU64,
    /// Total signals forwarded.
    pub signals_relayed: AtomicU64,
    /// Total `signal_failed` replies.
    pub signals_failed: AtomicU64,
    /// Total devices evicted by the liveness sweep.
    pub evictions_total: AtomicU64,
    /// Total protocol errors (bad JSON, unknown types, malformed messages).
    pub errors_total: AtomicU64,
    /// Currently open connections.
    pub connections_active: AtomicU64,
    /// Currently registered devices.
    pub devices_online: AtomicU64,
}

/// Work items for the coordinator.
#[derive(Debug)]
pub enum Command {
    /// A socket was accepted.
    Open {
        /// The new connection.
        conn: ConnectionId,
        /// Queue drained by the connection task.
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    /// A text frame arrived.
    Frame {
        /// Originating connection.
        conn: ConnectionId,
        /// Raw frame contents.
        text: String,
    },
    /// A socket closed.
    Close {
        /// The closed connection.
        conn: ConnectionId,
    },
    /// Run the liveness sweep.
    Sweep,
}

/// Cheap, cloneable handle to the coordinator.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_conn: Arc<AtomicU64>,
    metrics: Arc<RelayMetrics>,
}

impl RelayHandle {
    /// Spawn the coordinator task and return a handle to it.
    pub fn spawn(config: &Config) -> (Self, JoinHandle<()>) {
        let metrics = Arc::new(RelayMetrics::default());
        let state = RelayState::new(
            config.pairing.token_ttl(),
            config.liveness.timeout(),
            metrics.clone(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_coordinator(state, rx));
        (
            Self {
                commands: tx,
                next_conn: Arc::new(AtomicU64::new(1)),
                metrics,
            },
            task,
        )
    }

    /// Allocate an id for a new connection.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue a command for the coordinator.
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| RelayError::CoordinatorClosed)
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Whether the coordinator task is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

async fn run_coordinator(mut state: RelayState, mut commands: mpsc::UnboundedReceiver<Command>) {
    tracing::debug!("Relay coordinator started");
    while let Some(command) = commands.recv().await {
        let now = now_ms();
        match command {
            Command::Open { conn, outbound } => state.open(conn, outbound),
            Command::Frame { conn, text } => state.handle_frame(conn, &text, now),
            Command::Close { conn } => state.close(conn, now),
            Command::Sweep => {
                let evicted = state.sweep(now);
                if evicted.is_empty() {
                    tracing::debug!("Liveness sweep: all devices alive");
                }
            }
        }
    }
    tracing::debug!("Relay coordinator stopped");
}

/// Bind the configured address and serve until the listener fails.
pub async fn serve(config: Config) -> Result<()> {
    let addr: SocketAddr =
        config
            .server
            .bind_address
            .parse()
            .map_err(|e: std::net::AddrParseError| RelayError::InvalidBindAddress {
                address: config.server.bind_address.clone(),
                reason: e.to_string(),
            })?;
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, config).await
}

/// Serve the relay on an already-bound listener.
///
/// WebSocket clients connect on `/` or `/ws`; `/health` and `/metrics`
/// share the same port.
pub async fn serve_listener(listener: TcpListener, config: Config) -> Result<()> {
    health::init_start_time();
    let (relay, coordinator) = RelayHandle::spawn(&config);
    let sweep = spawn_liveness_sweep(relay.clone(), config.liveness.clone());
    let app = http::build_router(relay, config.http.metrics_enabled);

    tracing::info!("Relay listening on {}", listener.local_addr()?);
    let result = axum::serve(listener, app).await;

    sweep.abort();
    coordinator.abort();
    result.map_err(RelayError::from)
}
