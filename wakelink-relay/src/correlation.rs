//! Correlation table.
//!
//! Maps an outstanding request to the single consumer waiting for its
//! response. Entries are keyed by the peer expected to answer plus the
//! request id, so only that peer can resolve the wait and equal ids aimed at
//! different peers never collide. Every wait resolves exactly once: either
//! [`CorrelationTable::deliver`] or the deadline removes the entry first,
//! and whichever does wins.
//!
//! Dropping a [`PendingWait`] before it resolves (a caller going away)
//! removes its entry, so abandoned waits never leak.

use crate::error::{RelayError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use wakelink_types::{Packet, PeerId, RequestId};

/// Identifies one outstanding request: who must answer it, and its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    /// Peer the request was sent to.
    pub responder: PeerId,
    /// Correlation id chosen by the requester.
    pub request_id: RequestId,
}

impl WaitKey {
    /// Key for a response to `request_id` from `responder`.
    pub fn new(responder: PeerId, request_id: RequestId) -> Self {
        Self {
            responder,
            request_id,
        }
    }
}

/// `now + timeout`, saturating to a far-future deadline instead of overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The response arrived in time.
    Delivered(Packet),
    /// The deadline passed first.
    TimedOut,
}

/// What happened to a delivered response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// Handed to the waiting consumer.
    Delivered,
    /// Nobody was waiting; the response was discarded.
    NoWaiter,
}

#[derive(Debug)]
struct WaitSlot {
    token: u64,
    tx: oneshot::Sender<Packet>,
}

/// Outstanding requests and their waiters.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    waits: DashMap<WaitKey, WaitSlot>,
    next_token: AtomicU64,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for `key` that expires after `timeout`.
    ///
    /// Fails fast with [`RelayError::DuplicateWait`] if the key is already
    /// being waited on.
    pub fn begin_wait(self: &Arc<Self>, key: WaitKey, timeout: Duration) -> Result<PendingWait> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.waits.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(RelayError::DuplicateWait {
                    request_id: key.request_id,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(WaitSlot { token, tx });
            }
        }

        Ok(PendingWait {
            table: Arc::clone(self),
            key,
            token,
            deadline: deadline_after(timeout),
            rx,
        })
    }

    /// Resolve the wait for `key` with `packet`.
    ///
    /// With no waiter the packet is dropped; late responses are not kept.
    pub fn deliver(&self, key: &WaitKey, packet: Packet) -> DeliverOutcome {
        match self.waits.remove(key) {
            Some((_, slot)) => match slot.tx.send(packet) {
                Ok(()) => DeliverOutcome::Delivered,
                // Receiver dropped between our removal and the send.
                Err(_) => DeliverOutcome::NoWaiter,
            },
            None => DeliverOutcome::NoWaiter,
        }
    }

    /// Number of outstanding waits.
    pub fn len(&self) -> usize {
        self.waits.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    /// Whether `key` currently has a waiter.
    pub fn contains(&self, key: &WaitKey) -> bool {
        self.waits.contains_key(key)
    }

    /// Remove the entry only if it still belongs to the wait holding `token`.
    fn release(&self, key: &WaitKey, token: u64) -> bool {
        self.waits
            .remove_if(key, |_, slot| slot.token == token)
            .is_some()
    }
}

/// One in-flight wait for a response.
///
/// Resolve it with [`PendingWait::wait`]; drop it to cancel.
#[derive(Debug)]
pub struct PendingWait {
    table: Arc<CorrelationTable>,
    key: WaitKey,
    token: u64,
    deadline: Instant,
    rx: oneshot::Receiver<Packet>,
}

impl PendingWait {
    /// The correlation id being waited on.
    pub fn request_id(&self) -> &RequestId {
        &self.key.request_id
    }

    /// The peer whose answer resolves this wait.
    pub fn responder(&self) -> &PeerId {
        &self.key.responder
    }

    /// When this wait gives up.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until the response arrives or the deadline passes.
    pub async fn wait(mut self) -> WaitOutcome {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(packet)) => WaitOutcome::Delivered(packet),
            Ok(Err(_)) => WaitOutcome::TimedOut,
            Err(_) => {
                if self.table.release(&self.key, self.token) {
                    return WaitOutcome::TimedOut;
                }
                // `deliver` took the entry first; its send is already in flight.
                match (&mut self.rx).await {
                    Ok(packet) => WaitOutcome::Delivered(packet),
                    Err(_) => WaitOutcome::TimedOut,
                }
            }
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        self.table.release(&self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<CorrelationTable> {
        Arc::new(CorrelationTable::new())
    }

    fn key(id: impl Into<RequestId>) -> WaitKey {
        WaitKey::new(PeerId::device("D1"), id.into())
    }

    #[tokio::test]
    async fn deliver_resolves_waiter() {
        let table = table();
        let wait = table
            .begin_wait(key("r1"), Duration::from_secs(1))
            .unwrap();

        let outcome = table.deliver(&key("r1"), Packet::new("D1", "pong", "s"));
        assert_eq!(outcome, DeliverOutcome::Delivered);

        match wait.wait().await {
            WaitOutcome::Delivered(p) => assert_eq!(p.payload, "pong"),
            WaitOutcome::TimedOut => panic!("expected delivery"),
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn timeout_resolves_and_removes_entry() {
        let table = table();
        let wait = table
            .begin_wait(key("r1"), Duration::from_millis(20))
            .unwrap();

        assert_eq!(wait.wait().await, WaitOutcome::TimedOut);
        assert!(table.is_empty());

        // The late response finds nobody.
        let outcome = table.deliver(&key("r1"), Packet::new("D1", "late", "s"));
        assert_eq!(outcome, DeliverOutcome::NoWaiter);
    }

    #[test]
    fn deliver_without_waiter_leaves_no_state() {
        let table = table();
        let outcome = table.deliver(&key("ghost"), Packet::new("D1", "x", "s"));
        assert_eq!(outcome, DeliverOutcome::NoWaiter);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn duplicate_wait_fails_fast() {
        let table = table();
        let _first = table
            .begin_wait(key("r1"), Duration::from_secs(1))
            .unwrap();

        let err = table
            .begin_wait(key("r1"), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, RelayError::DuplicateWait { .. }));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn dropping_wait_cancels_it() {
        let table = table();
        let wait = table
            .begin_wait(key("r1"), Duration::from_secs(10))
            .unwrap();
        assert!(table.contains(&key("r1")));

        drop(wait);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn stale_drop_does_not_remove_newer_wait() {
        let table = table();
        let first = table
            .begin_wait(key("r1"), Duration::from_millis(10))
            .unwrap();
        assert_eq!(
            table.deliver(&key("r1"), Packet::new("D1", "a", "s")),
            DeliverOutcome::Delivered
        );

        // Same id reused after the first wait's entry is gone.
        let second = table
            .begin_wait(key("r1"), Duration::from_secs(10))
            .unwrap();
        drop(first);

        assert!(table.contains(&key("r1")));
        drop(second);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn deliver_racing_timeout_yields_exactly_one_outcome() {
        for i in 0..200 {
            let table = table();
            let id = key(format!("race-{i}"));
            let wait = table.begin_wait(id.clone(), Duration::from_millis(1)).unwrap();

            let deliverer = {
                let table = Arc::clone(&table);
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_micros(900)).await;
                    table.deliver(&id, Packet::new("D1", "x", "s"))
                })
            };

            let outcome = wait.wait().await;
            let delivered = deliverer.await.unwrap();

            match (outcome, delivered) {
                (WaitOutcome::Delivered(_), DeliverOutcome::Delivered) => {}
                (WaitOutcome::TimedOut, DeliverOutcome::NoWaiter) => {}
                (o, d) => panic!("inconsistent resolution: waiter={o:?} deliverer={d:?}"),
            }
            assert!(table.is_empty());
        }
    }

    #[tokio::test]
    async fn only_the_addressed_peer_can_answer() {
        let table = table();
        let wait = table.begin_wait(key("r1"), Duration::from_millis(50)).unwrap();

        let other = WaitKey::new(PeerId::device("D2"), RequestId::from("r1"));
        assert_eq!(
            table.deliver(&other, Packet::new("D2", "forged", "s")),
            DeliverOutcome::NoWaiter
        );
        assert!(table.contains(&key("r1")));

        assert_eq!(
            table.deliver(&key("r1"), Packet::new("D1", "real", "s")),
            DeliverOutcome::Delivered
        );
        match wait.wait().await {
            WaitOutcome::Delivered(p) => assert_eq!(p.payload, "real"),
            WaitOutcome::TimedOut => panic!("expected delivery"),
        }
    }

    #[tokio::test]
    async fn same_id_for_different_peers_does_not_collide() {
        let table = table();
        let _d1 = table.begin_wait(key("r1"), Duration::from_secs(1)).unwrap();
        let _d2 = table
            .begin_wait(
                WaitKey::new(PeerId::device("D2"), RequestId::from("r1")),
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn huge_timeout_saturates_instead_of_panicking() {
        let table = table();
        let wait = table.begin_wait(key("r1"), Duration::MAX).unwrap();
        assert!(wait.deadline() > Instant::now());

        table.deliver(&key("r1"), Packet::new("D1", "pong", "s"));
        assert!(matches!(wait.wait().await, WaitOutcome::Delivered(_)));
    }
}
