//! Error types for wakelink-relay.

use wakelink_types::{PacketError, PeerId, RequestId};

/// Main error type for relay operations.
///
/// None of these are fatal to the process; each one is scoped to a single
/// peer or request. A response nobody waits for is not an error; see
/// [`crate::correlation::DeliverOutcome::NoWaiter`].
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Destination backlog is full and the overflow policy rejected the packet.
    #[error("queue overflow for {peer} (capacity: {capacity})")]
    QueueOverflow {
        /// Destination peer.
        peer: PeerId,
        /// Configured per-peer capacity.
        capacity: usize,
    },

    /// An awaited response did not arrive before its deadline.
    #[error("timed out waiting for response to {request_id}")]
    ResponseTimeout {
        /// The correlation id that timed out.
        request_id: RequestId,
    },

    /// A response is already being awaited under this id.
    #[error("request {request_id} is already awaiting a response")]
    DuplicateWait {
        /// The contested correlation id.
        request_id: RequestId,
    },

    /// An immediate push through a live connection failed.
    #[error("push to {peer} failed: {reason}")]
    TransportPushFailed {
        /// Destination peer.
        peer: PeerId,
        /// Why the push failed.
        reason: String,
    },
}

/// Transport protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame could not be decoded into a packet.
    #[error("invalid packet: {0}")]
    Packet(#[from] PacketError),

    /// Frame exceeds the configured size limit.
    #[error("frame too large: {size} > {limit}")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Connection presented no token.
    #[error("authentication required")]
    AuthRequired,

    /// Token did not authenticate as the requested peer.
    #[error("invalid token for {peer}")]
    InvalidToken {
        /// Peer the connection claimed to be.
        peer: PeerId,
    },

    /// Authentication frame did not arrive in time.
    #[error("authentication timed out after {secs}s")]
    AuthTimeout {
        /// Configured timeout.
        secs: u64,
    },

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
