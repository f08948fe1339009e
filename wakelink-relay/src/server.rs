//! Main WakeRelay coordination.
//!
//! WakeRelay composes the connection registry, the outbound queue store and
//! the correlation table, and decides per packet whether it is pushed over a
//! live connection or queued for a later poll/reconnect.

use crate::config::Config;
use crate::correlation::{
    deadline_after, CorrelationTable, DeliverOutcome, PendingWait, WaitKey, WaitOutcome,
};
use crate::error::{RelayError, Result};
use crate::limits::RateLimits;
use crate::queue::{EnqueueOutcome, QueueStore};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, PushFailure};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use wakelink_types::{Packet, PeerId, RequestId, Role};

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Packets handed to a live connection.
    pub packets_pushed: AtomicU64,
    /// Packets stored for a later poll or reconnect.
    pub packets_queued: AtomicU64,
    /// Queued packets displaced by the drop-oldest policy.
    pub packets_evicted: AtomicU64,
    /// Packets refused because the destination queue was full.
    pub packets_rejected: AtomicU64,
    /// Pushes that failed and fell back to the queue.
    pub push_failures: AtomicU64,
    /// Responses handed to a waiting consumer.
    pub responses_delivered: AtomicU64,
    /// Responses discarded because nobody was waiting.
    pub responses_dropped: AtomicU64,
    /// Awaited responses that missed their deadline.
    pub waits_timed_out: AtomicU64,
    /// Connections registered.
    pub connections_total: AtomicU64,
    /// Total rate limit rejections (connection + message + global).
    pub rate_limit_hits: AtomicU64,
    /// Queued packets purged by retention cleanup.
    pub packets_expired: AtomicU64,
}

impl RelayMetrics {
    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            packets_pushed: load(&self.packets_pushed),
            packets_queued: load(&self.packets_queued),
            packets_evicted: load(&self.packets_evicted),
            packets_rejected: load(&self.packets_rejected),
            push_failures: load(&self.push_failures),
            responses_delivered: load(&self.responses_delivered),
            responses_dropped: load(&self.responses_dropped),
            waits_timed_out: load(&self.waits_timed_out),
            connections_total: load(&self.connections_total),
            rate_limit_hits: load(&self.rate_limit_hits),
            packets_expired: load(&self.packets_expired),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Serializable copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub packets_pushed: u64,
    pub packets_queued: u64,
    pub packets_evicted: u64,
    pub packets_rejected: u64,
    pub push_failures: u64,
    pub responses_delivered: u64,
    pub responses_dropped: u64,
    pub waits_timed_out: u64,
    pub connections_total: u64,
    pub rate_limit_hits: u64,
    pub packets_expired: u64,
}

/// How [`WakeRelay::send`] handled a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the peer's live connection.
    Pushed,
    /// Stored in the peer's queue.
    Queued,
    /// Stored after evicting the oldest queued packet.
    QueuedWithEviction,
    /// Refused: the peer's queue is full.
    Rejected,
}

impl SendOutcome {
    /// Wire name used in acknowledgements.
    pub fn as_str(&self) -> &'static str {
        match self {
            SendOutcome::Pushed => "pushed",
            SendOutcome::Queued => "queued",
            SendOutcome::QueuedWithEviction => "queued_with_eviction",
            SendOutcome::Rejected => "rejected",
        }
    }

    /// Whether the packet went out over a live connection.
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Pushed)
    }

    /// Whether the packet is waiting in a queue.
    pub fn is_queued(&self) -> bool {
        matches!(self, SendOutcome::Queued | SendOutcome::QueuedWithEviction)
    }

    /// Turn `Rejected` into [`RelayError::QueueOverflow`].
    pub fn into_result(self, peer: &PeerId, capacity: usize) -> Result<Self> {
        match self {
            SendOutcome::Rejected => Err(RelayError::QueueOverflow {
                peer: peer.clone(),
                capacity,
            }),
            accepted => Ok(accepted),
        }
    }
}

/// Derived per-peer connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// No live push connection; packets are queued.
    Unconnected,
    /// A live push connection is registered.
    Connected,
}

/// Operational snapshot of the relay core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Live push connections.
    pub connected_peers: usize,
    /// Packets queued across all peers.
    pub queue_depth: usize,
    /// Outstanding response waits.
    pub pending_waits: usize,
}

/// One admitted transport session, counted until dropped.
///
/// Held from before the WebSocket upgrade until the session ends, so sockets
/// still authenticating count against `limits.max_concurrent_connections`.
#[derive(Debug)]
pub struct SessionSlot {
    sessions: Arc<AtomicUsize>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Main relay coordinator.
pub struct WakeRelay {
    config: Config,
    registry: ConnectionRegistry,
    queues: QueueStore,
    correlations: Arc<CorrelationTable>,
    /// Serialises send and reconnect drain per peer.
    lanes: DashMap<PeerId, Arc<Mutex<()>>>,
    rate_limits: RateLimits,
    metrics: RelayMetrics,
    sessions: Arc<AtomicUsize>,
}

impl std::fmt::Debug for WakeRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeRelay")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl WakeRelay {
    /// Create a new WakeRelay with the given config.
    pub fn new(config: Config) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        let queues = QueueStore::new(config.relay.queue_capacity, config.relay.overflow_policy);
        Self {
            config,
            registry: ConnectionRegistry::new(),
            queues,
            correlations: Arc::new(CorrelationTable::new()),
            lanes: DashMap::new(),
            rate_limits,
            metrics: RelayMetrics::default(),
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    fn lane(&self, peer: &PeerId) -> Arc<Mutex<()>> {
        self.lanes.entry(peer.clone()).or_default().clone()
    }

    /// Route a packet to the device named in its `peer_id`.
    pub async fn send(&self, packet: Packet) -> SendOutcome {
        let peer = PeerId::device(packet.peer_id.clone());
        self.send_to(&peer, packet).await
    }

    /// Route a packet to `peer`: push if connected, queue otherwise.
    ///
    /// A failed push unregisters and closes the dead connection, then
    /// queues the packet so it is not lost.
    pub async fn send_to(&self, peer: &PeerId, packet: Packet) -> SendOutcome {
        let lane = self.lane(peer);
        let _turn = lane.lock().await;

        let packet = match self.registry.lookup(peer) {
            Some(handle) => match handle.push(packet, self.config.relay.push_timeout()).await {
                Ok(()) => {
                    bump(&self.metrics.packets_pushed);
                    tracing::debug!("Pushed packet to {} via {:?}", peer, handle.id());
                    return SendOutcome::Pushed;
                }
                Err(PushFailure { packet, reason }) => {
                    bump(&self.metrics.push_failures);
                    tracing::warn!("Push to {} failed ({}), falling back to queue", peer, reason);
                    self.registry.unregister(peer, handle.id());
                    handle.close();
                    packet
                }
            },
            None => packet,
        };

        self.enqueue(peer, packet)
    }

    fn enqueue(&self, peer: &PeerId, packet: Packet) -> SendOutcome {
        match self.queues.enqueue(peer, packet) {
            EnqueueOutcome::Accepted => {
                bump(&self.metrics.packets_queued);
                tracing::debug!("Queued packet for {} (depth: {})", peer, self.queues.depth(peer));
                SendOutcome::Queued
            }
            EnqueueOutcome::AcceptedWithEviction => {
                bump(&self.metrics.packets_queued);
                bump(&self.metrics.packets_evicted);
                tracing::warn!("Queue for {} full, evicted oldest packet", peer);
                SendOutcome::QueuedWithEviction
            }
            EnqueueOutcome::Rejected => {
                bump(&self.metrics.packets_rejected);
                tracing::warn!(
                    "Queue for {} full (capacity: {}), rejected packet",
                    peer,
                    self.queues.capacity()
                );
                SendOutcome::Rejected
            }
        }
    }

    /// Drain the peer's queue, waiting up to `wait` for something to arrive.
    ///
    /// `wait` is clamped to `relay.max_poll_wait_secs`. Returns an empty
    /// batch on timeout.
    pub async fn poll(&self, peer: &PeerId, wait: Duration) -> Vec<Packet> {
        let deadline = deadline_after(wait.min(self.config.relay.max_poll_wait()));
        let wake = self.queues.waker(peer);

        loop {
            let notified = wake.notified();
            tokio::pin!(notified);
            // Register interest before looking, so an enqueue in between still wakes us.
            notified.as_mut().enable();

            let packets = self.queues.dequeue_all(peer);
            if !packets.is_empty() {
                tracing::debug!("Poll by {} returned {} packets", peer, packets.len());
                return packets;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.queues.dequeue_all(peer);
            }
        }
    }

    /// Install a live push connection and flush the peer's backlog through it.
    ///
    /// Any previous connection for the peer is evicted and closed. Returns
    /// the number of backlog packets pushed. If a push fails mid-drain the
    /// rest goes back to the head of the queue, the new connection is
    /// unregistered, and the failure is returned.
    pub async fn register_connection(&self, handle: ConnectionHandle) -> Result<usize> {
        let peer = handle.peer().clone();
        let lane = self.lane(&peer);
        let _turn = lane.lock().await;

        bump(&self.metrics.connections_total);
        if let Some(evicted) = self.registry.register(handle.clone()) {
            evicted.close();
            tracing::info!("Replaced connection {:?} for {}", evicted.id(), peer);
        }
        tracing::info!("Registered connection {:?} for {}", handle.id(), peer);

        let mut backlog = self.queues.dequeue_all(&peer).into_iter();
        let mut drained = 0;
        while let Some(packet) = backlog.next() {
            match handle.push(packet, self.config.relay.push_timeout()).await {
                Ok(()) => {
                    bump(&self.metrics.packets_pushed);
                    drained += 1;
                }
                Err(PushFailure { packet, reason }) => {
                    bump(&self.metrics.push_failures);
                    let mut rest = vec![packet];
                    rest.extend(backlog);
                    tracing::warn!(
                        "Drain to {} failed after {} packets ({}), requeued {}",
                        peer,
                        drained,
                        reason,
                        rest.len()
                    );
                    self.queues.requeue_front(&peer, rest);
                    self.registry.unregister(&peer, handle.id());
                    handle.close();
                    return Err(RelayError::TransportPushFailed { peer, reason });
                }
            }
        }

        if drained > 0 {
            tracing::debug!("Drained {} queued packets to {}", drained, peer);
        }
        Ok(drained)
    }

    /// Remove the peer's connection if it is still `connection_id`.
    ///
    /// Stale unregisters (the connection was already replaced) are ignored.
    /// Queued packets are kept.
    pub fn unregister_connection(&self, peer: &PeerId, connection_id: ConnectionId) -> bool {
        let removed = self.registry.unregister(peer, connection_id);
        if removed {
            tracing::info!("Unregistered connection {:?} for {}", connection_id, peer);
        }
        removed
    }

    /// Hand a response from `responder` to whoever awaits `request_id` from
    /// that peer; discard it otherwise.
    ///
    /// A response from any other peer finds no waiter.
    pub fn deliver_response(
        &self,
        responder: &PeerId,
        request_id: &RequestId,
        packet: Packet,
    ) -> DeliverOutcome {
        let key = WaitKey::new(responder.clone(), request_id.clone());
        let outcome = self.correlations.deliver(&key, packet);
        match outcome {
            DeliverOutcome::Delivered => {
                bump(&self.metrics.responses_delivered);
                tracing::debug!("Delivered response {} from {}", request_id, responder);
            }
            DeliverOutcome::NoWaiter => {
                bump(&self.metrics.responses_dropped);
                tracing::debug!("Dropped response {} from {}: no waiter", request_id, responder);
            }
        }
        outcome
    }

    /// Start waiting for `responder` to answer `request_id`, without suspending.
    ///
    /// Lets a transport register the wait before the request goes out, so a
    /// fast response cannot slip past. Finish with [`Self::resolve_wait`].
    pub fn begin_await(
        &self,
        responder: &PeerId,
        request_id: RequestId,
        timeout: Duration,
    ) -> Result<PendingWait> {
        self.correlations
            .begin_wait(WaitKey::new(responder.clone(), request_id), timeout)
    }

    /// Suspend on a wait started by [`Self::begin_await`].
    pub async fn resolve_wait(&self, pending: PendingWait) -> Result<Packet> {
        let request_id = pending.request_id().clone();
        match pending.wait().await {
            WaitOutcome::Delivered(packet) => Ok(packet),
            WaitOutcome::TimedOut => {
                bump(&self.metrics.waits_timed_out);
                tracing::debug!("Response wait for {} timed out", request_id);
                Err(RelayError::ResponseTimeout { request_id })
            }
        }
    }

    /// Wait for `responder`'s response to `request_id`.
    pub async fn await_response(
        &self,
        responder: &PeerId,
        request_id: RequestId,
        timeout: Duration,
    ) -> Result<Packet> {
        let pending = self.begin_await(responder, request_id, timeout)?;
        self.resolve_wait(pending).await
    }

    /// Whether the peer currently has a live push connection.
    pub fn status(&self, peer: &PeerId) -> PeerStatus {
        if self.registry.is_connected(peer) {
            PeerStatus::Connected
        } else {
            PeerStatus::Unconnected
        }
    }

    /// Ids of connected peers in one namespace.
    pub fn connected_peers(&self, role: Role) -> Vec<String> {
        self.registry.connected_peers(role)
    }

    /// Number of packets queued for the peer.
    pub fn queue_depth(&self, peer: &PeerId) -> usize {
        self.queues.depth(peer)
    }

    /// Number of live push connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Claim a session slot, or `None` at `limits.max_concurrent_connections`.
    pub fn try_admit_session(&self) -> Option<SessionSlot> {
        let max = self.config.limits.max_concurrent_connections;
        self.sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| SessionSlot {
                sessions: Arc::clone(&self.sessions),
            })
    }

    /// Transport sessions currently admitted, authenticated or not.
    pub fn live_sessions(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }

    /// Operational snapshot.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connected_peers: self.registry.len(),
            queue_depth: self.queues.total_depth(),
            pending_waits: self.correlations.len(),
        }
    }

    /// Drop queued packets older than `max_age`. Returns how many were purged.
    pub fn purge_expired(&self, max_age: Duration) -> usize {
        let purged = self.queues.purge_older_than(max_age);
        if purged > 0 {
            self.metrics
                .packets_expired
                .fetch_add(purged as u64, Ordering::Relaxed);
        }
        purged
    }

    /// Forget delivery lanes nobody is using.
    pub fn prune_idle_lanes(&self) -> usize {
        let before = self.lanes.len();
        self.lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
        before - self.lanes.len()
    }

    /// Count a rate limit rejection.
    pub fn record_rate_limit_hit(&self) {
        bump(&self.metrics.rate_limit_hits);
    }
}
