//! Core error types for RAS

use std::path::PathBuf;
use std::time::Duration;

use ras_protocol::ProtocolError;
use thiserror::Error;

/// Cryptographic failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key derivation was handed an empty secret (caller bug)
    #[error("Cannot derive a key from an empty secret")]
    EmptySecret,

    /// Key material has the wrong length
    #[error("Invalid key length")]
    InvalidKey,

    /// Encryption failed (plaintext too large for the cipher)
    #[error("Encryption failed")]
    Encryption,

    /// Tag did not verify, the key was wrong or the input was truncated
    #[error("Authentication failed")]
    Authentication,
}

/// Transport-level failures
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Peer could not be reached
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// Bounded wait exceeded
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Peer closed the link
    #[error("Connection closed")]
    Closed,

    /// Peer answered but refused us
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Push relay failure
    #[error("Relay error: {0}")]
    Relay(String),

    /// Malformed frame from the peer
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Crypto failure while sealing or opening a frame
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Whether this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectionError::Timeout(_))
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
