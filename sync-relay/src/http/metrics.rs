//! Prometheus metrics endpoint.

use crate::server::{RelayHandle, RelayMetrics};
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;

/// Prometheus metrics handler.
pub async fn metrics_handler(Extension(relay): Extension<RelayHandle>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(relay.metrics()),
    )
}

fn render(m: &RelayMetrics) -> String {
    let load = |counter: &std::sync::atomic::AtomicU64| counter.load(Ordering::Relaxed);

    format!(
        r#"# HELP clipmesh_relay_connections_active Number of open WebSocket connections
# TYPE clipmesh_relay_connections_active gauge
clipmesh_relay_connections_active {connections}

# HELP clipmesh_relay_devices_online Number of registered devices
# TYPE clipmesh_relay_devices_online gauge
clipmesh_relay_devices_online {devices}

# HELP clipmesh_relay_info Server information
# TYPE clipmesh_relay_info gauge
clipmesh_relay_info{{version="{version}"}} 1

# HELP clipmesh_relay_connections_total Total connections accepted
# TYPE clipmesh_relay_connections_total counter
clipmesh_relay_connections_total {conns_total}

# HELP clipmesh_relay_registrations_total Total device registrations
# TYPE clipmesh_relay_registrations_total counter
clipmesh_relay_registrations_total {registrations}

# HELP clipmesh_relay_pair_tokens_total Total pairing tokens issued
# TYPE clipmesh_relay_pair_tokens_total counter
clipmesh_relay_pair_tokens_total {tokens}

# HELP clipmesh_relay_pairings_total Total pairings established
# TYPE clipmesh_relay_pairings_total counter
clipmesh_relay_pairings_total {pairings}

# HELP clipmesh_relay_pair_failures_total Total pairing attempts refused
# TYPE clipmesh_relay_pair_failures_total counter
clipmesh_relay_pair_failures_total {pair_failures}

# HELP clipmesh_relay_signals_total Total signals forwarded
# TYPE clipmesh_relay_signals_total counter
clipmesh_relay_signals_total {signals}

# HELP clipmesh_relay_signal_failures_total Total signals to offline devices
# TYPE clipmesh_relay_signal_failures_total counter
clipmesh_relay_signal_failures_total {signal_failures}

# HELP clipmesh_relay_evictions_total Total devices evicted for silence
# TYPE clipmesh_relay_evictions_total counter
clipmesh_relay_evictions_total {evictions}

# HELP clipmesh_relay_errors_total Total protocol errors
# TYPE clipmesh_relay_errors_total counter
clipmesh_relay_errors_total {errors}
"#,
        connections = load(&m.connections_active),
        devices = load(&m.devices_online),
        version = env!("CARGO_PKG_VERSION"),
        conns_total = load(&m.connections_total),
        registrations = load(&m.registrations_total),
        tokens = load(&m.tokens_issued),
        pairings = load(&m.pairings_total),
        pair_failures = load(&m.pair_failures),
        signals = load(&m.signals_relayed),
        signal_failures = load(&m.signals_failed),
        evictions = load(&m.evictions_total),
        errors = load(&m.errors_total),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_and_gauges() {
        let m = RelayMetrics::default();
        m.pairings_total.store(7, Ordering::Relaxed);
        m.devices_online.store(2, Ordering::Relaxed);

        let body = render(&m);
        assert!(body.contains("# TYPE clipmesh_relay_devices_online gauge"));
        assert!(body.contains("clipmesh_relay_devices_online 2\n"));
        assert!(body.contains("clipmesh_relay_pairings_total 7\n"));
        assert!(body.contains("clipmesh_relay_info{version="));
    }
}
