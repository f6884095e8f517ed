//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame did not start with the protocol magic
    #[error("Invalid frame header")]
    InvalidHeader,

    /// Peer speaks a protocol version we do not understand
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown message type
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// A datagram or relay frame did not contain exactly one message
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    /// Malformed pairing payload
    #[error("Invalid pairing payload: {0}")]
    Payload(#[from] PayloadError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON record error (relay and signaling bodies)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a pairing bootstrap record is rejected
///
/// All of these are raised before any key material is derived from the
/// embedded secret.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// QR text was not valid base64
    #[error("payload is not valid base64")]
    InvalidEncoding,

    /// Record ended before `field` could be read
    #[error("payload truncated while reading {field}")]
    Truncated { field: &'static str },

    /// Unknown record version
    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),

    /// Address family byte was neither 4 nor 6
    #[error("invalid address family {0}")]
    InvalidAddressFamily(u8),

    /// An address carried port 0
    #[error("{field} port must be non-zero")]
    ZeroPort { field: &'static str },

    /// Session identifier empty, too long or not printable ASCII
    #[error("invalid session identifier")]
    InvalidSessionId,

    /// Relay topic empty, too long or not printable ASCII
    #[error("invalid relay topic")]
    InvalidTopic,

    /// Relay topic does not belong to the embedded secret
    #[error("relay topic does not match pairing secret")]
    TopicMismatch,

    /// Flags byte has bits we do not know about
    #[error("unknown payload flags {0:#04x}")]
    UnknownFlags(u8),

    /// Extra bytes after the last field
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}
