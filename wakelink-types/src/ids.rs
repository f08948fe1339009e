//! Routing identifiers for WakeLink.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The namespace a peer identifier lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Embedded endpoint that executes commands.
    #[default]
    Device,
    /// Operator that issues commands and waits for responses.
    Client,
}

impl Role {
    /// Lowercase name used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Device => "device",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer identifier, unique within its [`Role`].
///
/// The relay never checks that a peer id is provisioned; it only uses it
/// as a routing key. `device:D1` and `client:D1` are different peers.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId {
    role: Role,
    id: String,
}

impl PeerId {
    /// Create a peer identifier in the given namespace.
    pub fn new(role: Role, id: impl Into<String>) -> Self {
        Self {
            role,
            id: id.into(),
        }
    }

    /// Create a device peer identifier.
    pub fn device(id: impl Into<String>) -> Self {
        Self::new(Role::Device, id)
    }

    /// Create a client peer identifier.
    pub fn client(id: impl Into<String>) -> Self {
        Self::new(Role::Client, id)
    }

    /// The namespace of this peer.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The identifier within its namespace.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}:{})", self.role, self.id)
    }
}

/// Correlation id linking a request to its eventual response.
///
/// Chosen by the requesting peer; the relay only compares it for equality.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap a request id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}
