//! Connection registry.
//!
//! Tracks which peers currently have a live push connection. At most one
//! connection is registered per peer; a new registration atomically evicts
//! the previous one and hands it back so the caller can close it.
//!
//! The registry performs no I/O. Pushing through a handle is the caller's
//! job, so send failures are handled without holding any registry lock.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use wakelink_types::{Packet, PeerId, Role, ServerFrame};

/// Unique identity of one connection, used to tell a stale handle from a current one.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Create a new random ConnectionId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", &self.0.to_string()[..8])
    }
}

/// Items handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A relayed packet.
    Packet(Packet),
    /// A control frame (ack, error, welcome).
    Frame(ServerFrame),
}

/// A push that did not reach the connection's writer.
///
/// Carries the packet back so it can be queued instead of lost.
#[derive(Debug)]
pub struct PushFailure {
    /// The packet that was not delivered.
    pub packet: Packet,
    /// Why the push failed.
    pub reason: String,
}

/// Send half of one live push connection.
///
/// Cheap to clone; all clones refer to the same connection. The transport
/// owns the matching receiver and writes whatever arrives to the wire.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: PeerId,
    connected_at: SystemTime,
    outbound: mpsc::Sender<Outbound>,
    closed: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Create a handle for `peer` and the receiver its writer task drains.
    pub fn channel(peer: PeerId, buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (closed, _) = watch::channel(false);
        let handle = Self {
            id: ConnectionId::new(),
            peer,
            connected_at: SystemTime::now(),
            outbound: tx,
            closed: Arc::new(closed),
        };
        (handle, rx)
    }

    /// Identity of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer this connection belongs to.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// When the connection was created.
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Push a packet to the writer, waiting at most `timeout` for buffer space.
    pub async fn push(&self, packet: Packet, timeout: Duration) -> Result<(), PushFailure> {
        if self.is_closed() {
            return Err(PushFailure {
                packet,
                reason: "connection closed".to_string(),
            });
        }

        // Reserve first so the packet stays ours if the writer never frees a slot.
        let reason = match tokio::time::timeout(timeout, self.outbound.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(Outbound::Packet(packet));
                return Ok(());
            }
            Ok(Err(_)) => "writer gone",
            Err(_) => "writer stalled",
        };
        Err(PushFailure {
            packet,
            reason: reason.to_string(),
        })
    }

    /// Queue a control frame for the writer without waiting.
    ///
    /// Control frames are best effort; a full or closed writer drops them.
    pub fn send_frame(&self, frame: ServerFrame) -> bool {
        self.outbound.try_send(Outbound::Frame(frame)).is_ok()
    }

    /// Mark the connection dead. The transport observes this via [`Self::closed`].
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.outbound.is_closed()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this only ends when the flag flips.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Live push connections, one per peer.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<PeerId, ConnectionHandle>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the peer's live connection.
    ///
    /// Returns the evicted previous handle, if any; the caller must close it.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let previous = self.connections.insert(handle.peer().clone(), handle);
        if let Some(prev) = &previous {
            tracing::debug!("Evicted connection {:?} for {}", prev.id(), prev.peer());
        }
        previous
    }

    /// Remove the peer's registration only if it is still `connection_id`.
    ///
    /// Returns `false` for a stale unregister (a newer connection already
    /// replaced this one, or nothing is registered).
    pub fn unregister(&self, peer: &PeerId, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(peer, |_, current| current.id() == connection_id)
            .is_some();
        if !removed {
            tracing::debug!("Ignoring stale unregister of {:?} for {}", connection_id, peer);
        }
        removed
    }

    /// The peer's live connection, if any.
    pub fn lookup(&self, peer: &PeerId) -> Option<ConnectionHandle> {
        self.connections.get(peer).map(|entry| entry.value().clone())
    }

    /// Whether the peer has a live connection.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections.contains_key(peer)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of connected peers in one namespace.
    pub fn connected_peers(&self, role: Role) -> Vec<String> {
        self.connections
            .iter()
            .filter(|entry| entry.key().role() == role)
            .map(|entry| entry.key().id().to_string())
            .collect()
    }
}
