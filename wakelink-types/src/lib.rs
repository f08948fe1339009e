//! # wakelink-types
//!
//! Wire format types for the WakeLink blind relay protocol.
//!
//! This crate provides the types shared by the relay and its peers:
//! - [`PeerId`], [`Role`], [`RequestId`] - Routing identifiers
//! - [`Packet`] - The opaque unit of relay (payload and signature never decoded)
//! - [`ClientFrame`], [`ServerFrame`] - Control frames around the packet stream
//! - [`PacketError`] - Decode and validation errors

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod frames;
mod ids;
mod packet;

pub use error::PacketError;
pub use frames::{ClientFrame, ErrorCode, ServerFrame};
pub use ids::{PeerId, RequestId, Role};
pub use packet::{Packet, PROTOCOL_VERSION};
