//! Packet - the opaque unit of relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PacketError, RequestId};

/// Protocol version spoken by this relay.
pub const PROTOCOL_VERSION: &str = "1.0";

/// A relayed packet.
///
/// This is the outer layer that the relay sees. `payload` and `signature`
/// are end-to-end encrypted material and are forwarded byte-for-byte;
/// only `peer_id` and `request_id` are ever inspected.
///
/// WakeLink v1.0 peers send `device_id` and `version`; both are accepted
/// as aliases of `peer_id` and `protocol_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Destination peer id (within the destination's namespace)
    #[serde(alias = "device_id")]
    pub peer_id: String,
    /// Encrypted payload (opaque to relay)
    pub payload: String,
    /// Payload signature (opaque to relay)
    pub signature: String,
    /// Peer-assigned counter, forwarded as-is (0 when absent)
    #[serde(default)]
    pub request_counter: i64,
    /// Protocol version declared by the sender, forwarded as-is
    #[serde(alias = "version")]
    pub protocol_version: String,
    /// Correlation id, present when a reply is expected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

/// Fields a packet must carry, each with its accepted aliases.
const REQUIRED_FIELDS: &[(&str, &[&str])] = &[
    ("peer_id", &["peer_id", "device_id"]),
    ("payload", &["payload"]),
    ("signature", &["signature"]),
    ("protocol_version", &["protocol_version", "version"]),
];

impl Packet {
    /// Create a packet for the current protocol version.
    pub fn new(
        peer_id: impl Into<String>,
        payload: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            payload: payload.into(),
            signature: signature.into(),
            request_counter: 0,
            protocol_version: PROTOCOL_VERSION.to_string(),
            request_id: None,
        }
    }

    /// Attach a correlation id.
    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach a request counter.
    pub fn with_counter(mut self, counter: i64) -> Self {
        self.request_counter = counter;
        self
    }

    /// Decode a packet from a JSON text frame.
    ///
    /// Distinguishes malformed JSON from well-formed JSON that lacks
    /// required fields, so transports can answer with the right error code.
    pub fn from_json(text: &str) -> Result<Self, PacketError> {
        let value: Value = serde_json::from_str(text).map_err(PacketError::InvalidJson)?;
        Self::from_value(value)
    }

    /// Decode a packet from an already parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, PacketError> {
        let object = value
            .as_object()
            .ok_or_else(|| PacketError::InvalidPacket("expected a JSON object".to_string()))?;

        let missing: Vec<&'static str> = REQUIRED_FIELDS
            .iter()
            .filter(|(_, keys)| !keys.iter().any(|k| object.contains_key(*k)))
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(PacketError::MissingFields(missing));
        }

        serde_json::from_value(value).map_err(|e| PacketError::InvalidPacket(e.to_string()))
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, PacketError> {
        serde_json::to_string(self).map_err(|e| PacketError::InvalidPacket(e.to_string()))
    }

    /// Serialize to MessagePack bytes (field names preserved).
    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        rmp_serde::to_vec_named(self).map_err(PacketError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        rmp_serde::from_slice(bytes).map_err(PacketError::Deserialization)
    }

    /// Reject packets declaring a protocol version other than [`PROTOCOL_VERSION`].
    pub fn check_version(&self) -> Result<(), PacketError> {
        if self.protocol_version == PROTOCOL_VERSION {
            Ok(())
        } else {
            Err(PacketError::UnsupportedVersion(self.protocol_version.clone()))
        }
    }
}
