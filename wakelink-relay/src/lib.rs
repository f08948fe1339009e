//! # wakelink-relay
//!
//! Blind relay server for WakeLink.
//!
//! This crate implements a relay server that:
//! - Accepts WebSocket connections from devices and clients
//! - Pushes packets to connected peers, queues them for offline ones
//! - Correlates client requests with device responses
//! - Never decodes payloads (relay is a "dumb pipe")
//!
//! ## Architecture
//!
//! ```text
//! Client ──┐                          ┌── Device
//!          │   WebSocket / HTTP poll  │
//!          ├─────────────────────────►│
//!          │                          │
//!      ┌───┴──────────────────────────┴───┐
//!      │           wakelink-relay         │
//!      │  registry │ queues │ correlation │
//!      └──────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! - Connected peer: packet pushed immediately
//! - Unconnected peer: packet queued (bounded FIFO), drained on reconnect or poll
//! - Response with `request_id`: handed to the waiting requester, dropped otherwise

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod cleanup;
pub mod config;
pub mod correlation;
pub mod error;
pub mod http;
pub mod limits;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;

pub use error::{RelayError, Result};
pub use server::{SendOutcome, WakeRelay};
