//! HTTP push / long-poll endpoints.
//!
//! For peers that cannot hold a WebSocket open. Both endpoints authenticate
//! through the same [`Authenticator`] as the WebSocket sessions.

use crate::auth::{token_from_headers, AuthOutcome, Authenticator};
use crate::server::{MetricsSnapshot, RelayStats, WakeRelay};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use wakelink_types::{ErrorCode, Packet, PeerId, Role, ServerFrame};

/// An error answered as a JSON error frame.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ServerFrame::error(self.code, self.message))).into_response()
    }
}

/// Body of `POST /api/pull`.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    /// Whose queue to drain.
    pub peer_id: String,
    /// Namespace of `peer_id` (default: device).
    #[serde(default)]
    pub role: Role,
    /// Seconds to hold the request open while the queue is empty.
    #[serde(default)]
    pub wait: u64,
}

/// Answer to `POST /api/pull`.
#[derive(Debug, Clone, Serialize)]
pub struct PullResponse {
    /// Always `success`.
    pub status: &'static str,
    /// Whose queue was drained.
    pub peer_id: String,
    /// Drained packets, oldest first.
    pub messages: Vec<Packet>,
    /// Number of packets.
    pub count: usize,
}

/// Answer to `GET /api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Core snapshot.
    #[serde(flatten)]
    pub relay: RelayStats,
    /// Ids of connected devices.
    pub connected_devices: Vec<String>,
    /// Ids of connected clients.
    pub connected_clients: Vec<String>,
    /// Monotonic counters.
    pub counters: MetricsSnapshot,
}

async fn authenticate(
    headers: &HeaderMap,
    authenticator: &dyn Authenticator,
) -> Result<PeerId, ApiError> {
    let token = token_from_headers(headers).ok_or_else(|| {
        ApiError::new(StatusCode::UNAUTHORIZED, ErrorCode::AuthRequired, "API token required")
    })?;
    match authenticator.authenticate(&token).await {
        AuthOutcome::Valid(peer) => Ok(peer),
        AuthOutcome::Invalid => Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidToken,
            "Invalid API token",
        )),
    }
}

fn check_rate(relay: &WakeRelay, peer: &PeerId) -> Result<(), ApiError> {
    relay.rate_limits().check_packet(peer).map_err(|e| {
        tracing::warn!("Rate limited {}: {}", peer, e);
        relay.record_rate_limit_hit();
        ApiError::new(StatusCode::TOO_MANY_REQUESTS, ErrorCode::RateLimited, e.to_string())
    })
}

/// `POST /api/push`: relay one packet to a peer.
///
/// The body is a packet plus an optional `role` naming the destination
/// namespace (default: device).
pub async fn push_handler(
    headers: HeaderMap,
    Extension(relay): Extension<Arc<WakeRelay>>,
    Extension(authenticator): Extension<Arc<dyn Authenticator>>,
    Json(mut body): Json<serde_json::Value>,
) -> Result<Json<ServerFrame>, ApiError> {
    let sender = authenticate(&headers, authenticator.as_ref()).await?;
    check_rate(&relay, &sender)?;

    let role = match body.as_object_mut().and_then(|o| o.remove("role")) {
        Some(value) => serde_json::from_value::<Role>(value).map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidPacket, e.to_string())
        })?,
        None => Role::Device,
    };
    let packet = Packet::from_value(body)
        .and_then(|p| p.check_version().map(|()| p))
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::from(&e), e.to_string()))?;

    let target = PeerId::new(role, packet.peer_id.clone());
    let request_id = packet.request_id.clone();
    let capacity = relay.config().relay.queue_capacity;

    let outcome = relay
        .send_to(&target, packet)
        .await
        .into_result(&target, capacity)
        .map_err(|e| {
            ApiError::new(StatusCode::TOO_MANY_REQUESTS, ErrorCode::QueueOverflow, e.to_string())
        })?;

    tracing::debug!("HTTP push from {} to {}: {}", sender, target, outcome.as_str());
    Ok(Json(ServerFrame::Success {
        peer_id: target.id().to_string(),
        mode: outcome.as_str().to_string(),
        delivered: outcome.is_delivered(),
        queued: outcome.is_queued(),
        request_id,
    }))
}

/// `POST /api/pull`: drain the caller's own queue, long-polling if empty.
pub async fn pull_handler(
    headers: HeaderMap,
    Extension(relay): Extension<Arc<WakeRelay>>,
    Extension(authenticator): Extension<Arc<dyn Authenticator>>,
    Json(request): Json<PullRequest>,
) -> Result<Json<PullResponse>, ApiError> {
    let caller = authenticate(&headers, authenticator.as_ref()).await?;
    let peer = PeerId::new(request.role, request.peer_id);
    if caller != peer {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            ErrorCode::InvalidToken,
            format!("token does not authenticate as {peer}"),
        ));
    }
    check_rate(&relay, &peer)?;

    let messages = relay.poll(&peer, Duration::from_secs(request.wait)).await;
    Ok(Json(PullResponse {
        status: "success",
        peer_id: peer.id().to_string(),
        count: messages.len(),
        messages,
    }))
}

/// `GET /api/stats`: relay snapshot.
pub async fn stats_handler(Extension(relay): Extension<Arc<WakeRelay>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        relay: relay.stats(),
        connected_devices: relay.connected_peers(Role::Device),
        connected_clients: relay.connected_peers(Role::Client),
        counters: relay.metrics().snapshot(),
    })
}
