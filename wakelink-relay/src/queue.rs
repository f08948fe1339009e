//! Outbound queue store.
//!
//! Per-peer FIFO of packets addressed to peers that are not push-connected.
//! Queues are created lazily and bounded by a configured capacity; what
//! happens on overflow is an explicit [`OverflowPolicy`].
//!
//! Each queue carries a wake signal that fires on every accepted enqueue,
//! which is what long-polling peers park on.

use dashmap::DashMap;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use wakelink_types::{Packet, PeerId};

/// What to do when a packet arrives for a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new packet; the queue is left untouched.
    Reject,
    /// Evict the oldest packet, then append the new one.
    #[default]
    DropOldest,
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended without displacing anything.
    Accepted,
    /// Appended after evicting the oldest packet.
    AcceptedWithEviction,
    /// Not appended; the queue was full under [`OverflowPolicy::Reject`].
    Rejected,
}

#[derive(Debug)]
struct QueuedPacket {
    packet: Packet,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct PeerQueue {
    packets: VecDeque<QueuedPacket>,
    wake: Arc<Notify>,
}

/// Per-peer bounded FIFO queues.
#[derive(Debug)]
pub struct QueueStore {
    queues: DashMap<PeerId, PeerQueue>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl QueueStore {
    /// Create a store whose queues hold at most `capacity` packets each.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    /// Per-peer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Append a packet to the peer's queue, applying the overflow policy.
    pub fn enqueue(&self, peer: &PeerId, packet: Packet) -> EnqueueOutcome {
        let mut queue = self.queues.entry(peer.clone()).or_default();

        let outcome = if queue.packets.len() < self.capacity {
            EnqueueOutcome::Accepted
        } else {
            match self.policy {
                OverflowPolicy::Reject => return EnqueueOutcome::Rejected,
                OverflowPolicy::DropOldest => {
                    queue.packets.pop_front();
                    EnqueueOutcome::AcceptedWithEviction
                }
            }
        };

        queue.packets.push_back(QueuedPacket {
            packet,
            enqueued_at: Instant::now(),
        });
        queue.wake.notify_waiters();
        outcome
    }

    /// Remove and return every queued packet for the peer, oldest first.
    ///
    /// The (now empty) queue entry is kept so parked pollers stay attached
    /// to the same wake signal; the cleanup task drops idle entries.
    pub fn dequeue_all(&self, peer: &PeerId) -> Vec<Packet> {
        match self.queues.get_mut(peer) {
            Some(mut queue) => queue.packets.drain(..).map(|q| q.packet).collect(),
            None => Vec::new(),
        }
    }

    /// Put undelivered packets back at the head of the queue, order preserved.
    ///
    /// Used when a reconnect drain fails part-way. Packets keep their new
    /// enqueue time, so retention restarts for them.
    pub fn requeue_front(&self, peer: &PeerId, packets: Vec<Packet>) {
        if packets.is_empty() {
            return;
        }
        let mut queue = self.queues.entry(peer.clone()).or_default();
        let now = Instant::now();
        for packet in packets.into_iter().rev() {
            queue.packets.push_front(QueuedPacket {
                packet,
                enqueued_at: now,
            });
        }
        // Capacity still holds: oldest surplus is dropped from the front.
        while queue.packets.len() > self.capacity {
            queue.packets.pop_front();
        }
        queue.wake.notify_waiters();
    }

    /// Whether the peer has nothing queued.
    pub fn is_empty(&self, peer: &PeerId) -> bool {
        self.depth(peer) == 0
    }

    /// Number of packets queued for the peer.
    pub fn depth(&self, peer: &PeerId) -> usize {
        self.queues.get(peer).map(|q| q.packets.len()).unwrap_or(0)
    }

    /// Number of packets queued across all peers.
    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(|q| q.packets.len()).sum()
    }

    /// Wake signal for the peer's queue, creating the entry if needed.
    pub fn waker(&self, peer: &PeerId) -> Arc<Notify> {
        self.queues.entry(peer.clone()).or_default().wake.clone()
    }

    /// Drop packets that have been queued longer than `max_age`.
    ///
    /// Also removes empty queues nobody is parked on. Returns the number of
    /// packets purged.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let mut purged = 0;
        self.queues.retain(|_, queue| {
            let before = queue.packets.len();
            queue.packets.retain(|q| q.enqueued_at.elapsed() < max_age);
            purged += before - queue.packets.len();
            !queue.packets.is_empty() || Arc::strong_count(&queue.wake) > 1
        });
        purged
    }

    /// Number of peers with a queue entry (including empty ones).
    pub fn tracked_peers(&self) -> usize {
        self.queues.len()
    }
}
