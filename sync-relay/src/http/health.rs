//! `/health`: liveness of the coordinator plus a few gauges.

use crate::server::{RelayHandle, RelayMetrics};
use axum::{http::StatusCode, Extension, Json};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;
use std::time::Instant;

static STARTED: OnceLock<Instant> = OnceLock::new();

/// Record the process start. Later calls are no-ops.
pub fn init_start_time() {
    STARTED.get_or_init(Instant::now);
}

/// Body of the `/health` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    /// `ok`, or `degraded` once the coordinator has stopped.
    pub status: &'static str,
    /// Relay version.
    pub version: &'static str,
    /// Open WebSocket connections.
    pub connections: u64,
    /// Registered devices.
    pub devices: u64,
    /// Pairings established since start.
    pub pairings: u64,
    /// Seconds since start.
    pub uptime_seconds: u64,
}

impl HealthStatus {
    /// Snapshot the relay's gauges.
    pub fn snapshot(metrics: &RelayMetrics, running: bool) -> Self {
        Self {
            status: if running { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            connections: metrics.connections_active.load(Ordering::Relaxed),
            devices: metrics.devices_online.load(Ordering::Relaxed),
            pairings: metrics.pairings_total.load(Ordering::Relaxed),
            uptime_seconds: STARTED.get().map_or(0, |start| start.elapsed().as_secs()),
        }
    }
}

/// Health check handler. Answers 503 when the coordinator is gone.
pub async fn health_handler(
    Extension(relay): Extension<RelayHandle>,
) -> (StatusCode, Json<HealthStatus>) {
    let running = relay.is_running();
    let code = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthStatus::snapshot(relay.metrics(), running)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_gauges() {
        let metrics = RelayMetrics::default();
        metrics.devices_online.store(3, Ordering::Relaxed);
        metrics.pairings_total.store(2, Ordering::Relaxed);

        let status = HealthStatus::snapshot(&metrics, true);
        assert_eq!(status.status, "ok");
        assert_eq!(status.devices, 3);
        assert_eq!(status.pairings, 2);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
    }

    #[test]
    fn stopped_coordinator_is_degraded() {
        let status = HealthStatus::snapshot(&RelayMetrics::default(), false);
        assert_eq!(status.status, "degraded");
    }
}
