//! Error types for WakeLink wire handling.

use thiserror::Error;

/// Errors produced while decoding or validating inbound packets.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Required packet fields are absent.
    #[error("missing fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    /// Fields are present but have the wrong shape.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// The packet declares a protocol version the relay does not speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_display() {
        let err = PacketError::MissingFields(vec!["payload", "signature"]);
        assert_eq!(err.to_string(), "missing fields: payload, signature");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PacketError>();
    }
}
