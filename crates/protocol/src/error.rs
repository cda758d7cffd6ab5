//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Datagram errors
    /// Datagram exceeds the maximum size a responder will accept.
    #[error("datagram too large: {size} bytes exceeds maximum of {max} bytes")]
    DatagramTooLarge {
        /// Actual datagram size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A well-formed message carried a type this endpoint does not handle.
    #[error("unexpected message type: {0}")]
    UnexpectedType(String),

    // Event errors
    /// The event envelope had an empty name.
    #[error("event name must not be empty")]
    EmptyEventName,

    /// An event payload did not have the expected shape.
    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload {
        /// Event the payload belonged to.
        event: String,
        /// Why decoding failed.
        reason: String,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

/// Result type alias using `ProtocolError`.
pub type Result<T> = std::result::Result<T, ProtocolError>;
