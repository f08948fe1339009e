//! HTTP endpoints for wakelink-relay.
//!
//! Provides health checks, metrics, the push/pull API and the WebSocket
//! upgrade routes.

mod api;
pub mod health;
mod metrics;

use crate::auth::Authenticator;
use crate::protocol::{client_ws_handler, device_ws_handler};
use crate::server::WakeRelay;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;

pub use api::{PullRequest, PullResponse, StatsResponse};
pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<WakeRelay>, authenticator: Arc<dyn Authenticator>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/stats", get(api::stats_handler))
        .route("/api/push", post(api::push_handler))
        .route("/api/pull", post(api::pull_handler))
        .route("/ws/device/:peer", get(device_ws_handler))
        .route("/ws/client/:peer", get(client_ws_handler));

    if relay.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }

    router.layer(Extension(relay)).layer(Extension(authenticator))
}
