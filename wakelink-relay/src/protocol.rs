//! WebSocket upgrade handlers.
//!
//! Devices connect to `/ws/device/{peer}`, clients to `/ws/client/{peer}`.
//! Admission checks run before the upgrade; everything after it belongs to
//! the spawned [`Session`].

use crate::auth::{token_from_headers, Authenticator};
use crate::server::WakeRelay;
use crate::session::Session;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::StreamExt;
use std::sync::Arc;
use wakelink_types::{ErrorCode, PeerId, ServerFrame};

/// Upgrade handler for device connections.
pub async fn device_ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Path(peer): Path<String>,
    headers: HeaderMap,
    Extension(relay): Extension<Arc<WakeRelay>>,
    Extension(authenticator): Extension<Arc<dyn Authenticator>>,
) -> Response {
    accept(ws, PeerId::device(peer), &headers, relay, authenticator)
}

/// Upgrade handler for client connections.
pub async fn client_ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Path(peer): Path<String>,
    headers: HeaderMap,
    Extension(relay): Extension<Arc<WakeRelay>>,
    Extension(authenticator): Extension<Arc<dyn Authenticator>>,
) -> Response {
    accept(ws, PeerId::client(peer), &headers, relay, authenticator)
}

fn accept(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    peer: PeerId,
    headers: &HeaderMap,
    relay: Arc<WakeRelay>,
    authenticator: Arc<dyn Authenticator>,
) -> Response {
    // Rate limit check: prevent reconnect flooding from a single peer
    if let Err(e) = relay.rate_limits().check_connection(&peer) {
        tracing::warn!("Connection rate limited for {}: {}", peer, e);
        relay.record_rate_limit_hit();
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ServerFrame::error(ErrorCode::RateLimited, e.to_string())),
        )
            .into_response();
    }

    // Counts sockets from admission on, including those still authenticating
    let Some(slot) = relay.try_admit_session() else {
        tracing::warn!(
            "Connection limit reached ({}), rejecting {}",
            relay.config().limits.max_concurrent_connections,
            peer
        );
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ServerFrame::error(ErrorCode::Internal, "too many connections")),
        )
            .into_response();
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let header_token = token_from_headers(headers);
    let max_frame_size = relay.config().limits.max_frame_size;

    ws.max_message_size(max_frame_size)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            tracing::debug!("WebSocket upgraded for {}", peer);
            let (sink, stream) = socket.split();
            let session = Session::new(relay, authenticator, peer, header_token);
            if let Err(e) = session.run(sink, stream).await {
                tracing::debug!("Session ended with error: {}", e);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuthenticator;
    use crate::config::Config;
    use crate::http::build_router;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn json_error(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["error"].as_str().unwrap_or_default().to_string()
    }

    fn upgrade_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn plain_get_is_not_upgraded() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let app = build_router(relay, Arc::new(StaticTokenAuthenticator::new()));

        let response = app
            .oneshot(Request::builder().uri("/ws/device/D1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn connection_rate_limit_rejects_before_upgrade() {
        let mut config = Config::default();
        config.limits.connections_per_minute = 1;
        let relay = Arc::new(WakeRelay::new(config));
        relay
            .rate_limits()
            .check_connection(&PeerId::device("D1"))
            .unwrap();

        let app = build_router(Arc::clone(&relay), Arc::new(StaticTokenAuthenticator::new()));
        let response = app.oneshot(upgrade_request("/ws/device/D1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(relay.metrics().snapshot().rate_limit_hits, 1);
    }

    #[tokio::test]
    async fn sessions_awaiting_auth_count_toward_limit() {
        let mut config = Config::default();
        config.limits.max_concurrent_connections = 1;
        let relay = Arc::new(WakeRelay::new(config));
        // An admitted socket that has not authenticated yet.
        let _pending = relay.try_admit_session().unwrap();
        assert_eq!(relay.connection_count(), 0);

        let app = build_router(Arc::clone(&relay), Arc::new(StaticTokenAuthenticator::new()));
        let response = app.oneshot(upgrade_request("/ws/device/D1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_error(response).await, "INTERNAL");
    }

    #[tokio::test]
    async fn rejected_upgrade_releases_its_slot() {
        let mut config = Config::default();
        config.limits.max_concurrent_connections = 1;
        let relay = Arc::new(WakeRelay::new(config));

        let app = build_router(Arc::clone(&relay), Arc::new(StaticTokenAuthenticator::new()));
        let response = app
            .oneshot(Request::builder().uri("/ws/device/D1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert_eq!(relay.live_sessions(), 0);
    }
}
