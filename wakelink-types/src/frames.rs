//! Control frames exchanged around the packet stream.
//!
//! Packets themselves travel as bare [`crate::Packet`] JSON. These frames
//! cover authentication, acknowledgements and errors.

use serde::{Deserialize, Serialize};

use crate::{PacketError, RequestId, Role};

/// Frames a peer sends that are not packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on a connection: present an API token.
    Auth {
        /// Token handed to the authentication collaborator.
        token: String,
    },
}

impl ClientFrame {
    /// Try to read a control frame; `None` if the text is something else.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Machine-readable error codes sent to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No token was presented.
    AuthRequired,
    /// The token did not authenticate as this peer.
    InvalidToken,
    /// Frame was not JSON.
    InvalidJson,
    /// Frame was JSON but not a usable packet.
    InvalidPacket,
    /// Packet declared an unknown protocol version.
    UnsupportedVersion,
    /// Peer or relay rate limit exceeded.
    RateLimited,
    /// Destination backlog is full and the packet was rejected.
    QueueOverflow,
    /// A response is already awaited under this request id.
    DuplicateRequest,
    /// No response arrived before the deadline.
    Timeout,
    /// Unexpected relay failure.
    Internal,
}

impl From<&PacketError> for ErrorCode {
    fn from(err: &PacketError) -> Self {
        match err {
            PacketError::InvalidJson(_) => ErrorCode::InvalidJson,
            PacketError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            PacketError::MissingFields(_)
            | PacketError::InvalidPacket(_)
            | PacketError::Deserialization(_) => ErrorCode::InvalidPacket,
            PacketError::Serialization(_) => ErrorCode::Internal,
        }
    }
}

/// Frames the relay sends that are not packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Authentication succeeded; the connection is registered.
    Connected {
        /// Id of the authenticated peer.
        peer_id: String,
        /// Namespace of the authenticated peer.
        role: Role,
        /// Protocol version spoken by the relay.
        protocol_version: String,
    },
    /// A packet from this peer was accepted for delivery.
    Success {
        /// Destination of the acknowledged packet.
        peer_id: String,
        /// Delivery mode actually used (`pushed`, `queued`, ...).
        mode: String,
        /// Delivered over a live connection.
        delivered: bool,
        /// Waiting in the destination's queue.
        queued: bool,
        /// Correlation id of the acknowledged packet.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
    /// Something went wrong with a frame or a pending request.
    Error {
        /// Machine-readable code.
        error: ErrorCode,
        /// Human-readable detail.
        message: String,
        /// Correlation id the error refers to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
}

impl ServerFrame {
    /// Build an error frame without a correlation id.
    pub fn error(error: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error,
            message: message.into(),
            request_id: None,
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, PacketError> {
        serde_json::to_string(self).map_err(|e| PacketError::InvalidPacket(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auth_frame() {
        let frame = ClientFrame::parse(r#"{"type":"auth","token":"secret"}"#);
        assert_eq!(
            frame,
            Some(ClientFrame::Auth {
                token: "secret".to_string()
            })
        );
    }

    #[test]
    fn packet_is_not_a_control_frame() {
        let frame = ClientFrame::parse(
            r#"{"device_id":"D1","payload":"x","signature":"s","version":"1.0"}"#,
        );
        assert!(frame.is_none());
    }

    #[test]
    fn error_frame_shape() {
        let json = ServerFrame::error(ErrorCode::InvalidToken, "Invalid API token")
            .to_json()
            .unwrap();
        assert!(json.contains("\"status\":\"error\""));
        assert!(json.contains("\"error\":\"INVALID_TOKEN\""));
        assert!(!json.contains("request_id"));
    }

    #[test]
    fn ack_frame_shape() {
        let json = ServerFrame::Success {
            peer_id: "D1".to_string(),
            mode: "queued".to_string(),
            delivered: false,
            queued: true,
            request_id: Some(RequestId::from("r2")),
        }
        .to_json()
        .unwrap();
        assert!(json.contains("\"status\":\"success\""));
        assert!(json.contains("\"mode\":\"queued\""));
        assert!(json.contains("\"request_id\":\"r2\""));
    }

    #[test]
    fn packet_errors_map_to_codes() {
        assert_eq!(
            ErrorCode::from(&PacketError::MissingFields(vec!["payload"])),
            ErrorCode::InvalidPacket
        );
        assert_eq!(
            ErrorCode::from(&PacketError::UnsupportedVersion("0.9".into())),
            ErrorCode::UnsupportedVersion
        );
    }
}
