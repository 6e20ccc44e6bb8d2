//! HTTP endpoints for sync-relay.
//!
//! The WebSocket upgrade, health checks and metrics share one router.

pub mod health;
mod metrics;

use crate::server::RelayHandle;
use crate::session::ws_handler;
use axum::{routing::get, Extension, Router};

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: RelayHandle, metrics_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health::health_handler));
    if metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(relay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    fn test_relay() -> RelayHandle {
        RelayHandle::spawn(&Config::default()).0
    }

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = build_router(test_relay(), true);
        assert_eq!(get_status(app, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let app = build_router(test_relay(), true);
        assert_eq!(get_status(app, "/metrics").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_can_be_disabled() {
        let app = build_router(test_relay(), false);
        assert_eq!(get_status(app, "/metrics").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plain_get_on_ws_route_is_not_an_upgrade() {
        let app = build_router(test_relay(), true);
        let status = get_status(app, "/ws").await;
        assert!(status.is_client_error());
    }
}
