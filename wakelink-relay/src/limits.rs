//! Rate limiting for wakelink-relay.
//!
//! Provides protection against reconnect flooding and packet spam.
//!
//! ## Design Notes
//!
//! Peers are identified by their authenticated [`PeerId`], not by IP: devices
//! often sit behind shared NAT. We rate limit by:
//! - **PeerId** for connection attempts (WebSocket upgrades)
//! - **PeerId** for packet operations (send, poll)
//! - a single global limiter for aggregate throughput
//!
//! Keyed limiters use governor's DashMap-backed state store.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use wakelink_types::PeerId;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits connection attempts per peer.
    connection_limiter: Arc<KeyedLimiter<PeerId>>,
    /// Limits packet operations per peer.
    message_limiter: Arc<KeyedLimiter<PeerId>>,
    /// Caps aggregate throughput even if every peer is within its own quota.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<PeerId>")
            .field("message_limiter", &"KeyedLimiter<PeerId>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero quotas are rejected by [`crate::config::Config::validate`];
    /// if one slips through it is treated as a quota of one.
    pub fn new(config: &LimitsConfig) -> Self {
        let connection_quota = Quota::per_minute(non_zero(config.connections_per_minute));
        let message_quota = Quota::per_minute(non_zero(config.messages_per_minute));
        let global_quota = Quota::per_second(non_zero(config.global_requests_per_second));

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            message_limiter: Arc::new(RateLimiter::keyed(message_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if a connection attempt by `peer` is allowed.
    pub fn check_connection(&self, peer: &PeerId) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(peer)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if a packet operation by `peer` is allowed.
    pub fn check_message(&self, peer: &PeerId) -> Result<(), RateLimitError> {
        self.message_limiter
            .check_key(peer)
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Check if the global request rate is within limits.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Global check followed by the per-peer packet check.
    pub fn check_packet(&self, peer: &PeerId) -> Result<(), RateLimitError> {
        self.check_global()?;
        self.check_message(peer)
    }

    /// Get the number of tracked connection keys (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Get the number of tracked message keys (for metrics).
    pub fn message_keys_count(&self) -> usize {
        self.message_limiter.len()
    }

    /// Evict entries of idle peers whose quota has fully recharged.
    ///
    /// Called periodically from the cleanup task.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.message_limiter.retain_recent();
    }
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many connection attempts from this peer.
    #[error("connection rate limit exceeded")]
    ConnectionLimitExceeded,
    /// Too many packets from this peer.
    #[error("message rate limit exceeded")]
    MessageLimitExceeded,
    /// Global request rate exceeded across all peers.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
}
