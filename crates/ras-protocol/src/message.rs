//! Message types for the RAS control channel
//!
//! These are the messages exchanged over an established path (TCP, UDP or
//! relay). Messages are serialized into frames using the codec defined in
//! `codec.rs`.
//!
//! # Message Flow
//!
//! 1. Client sends `Hello` with the session id and a fresh nonce
//! 2. Daemon answers `Challenge`: its own nonce plus
//!    `HMAC(auth_key, "ras-daemon" | client_nonce | daemon_nonce)`
//! 3. Client verifies the proof and sends `ChallengeResponse` with
//!    `HMAC(auth_key, "ras-client" | daemon_nonce | client_nonce)`
//! 4. Daemon verifies and sends `AuthResult`
//! 5. `Ping`/`Pong` keep the path alive; `Data` carries opaque collaborator frames
//! 6. Either side sends `Close` before tearing the path down
//!
//! `Probe` is only used on UDP while hole punching, before step 1.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Current protocol version, carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the challenge nonces exchanged during authentication
pub const AUTH_NONCE_SIZE: usize = 32;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client opens authentication
    Hello = 0x01,
    /// Daemon proves itself and challenges the client
    Challenge = 0x02,
    /// Client answers the daemon's challenge
    ChallengeResponse = 0x03,
    /// Final verdict from the daemon
    AuthResult = 0x04,
    /// Keepalive ping
    Ping = 0x05,
    /// Keepalive acknowledgment
    Pong = 0x06,
    /// Opaque collaborator data
    Data = 0x07,
    /// Orderly shutdown
    Close = 0x08,
    /// UDP hole-punch probe
    Probe = 0x09,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Challenge),
            0x03 => Some(Self::ChallengeResponse),
            0x04 => Some(Self::AuthResult),
            0x05 => Some(Self::Ping),
            0x06 => Some(Self::Pong),
            0x07 => Some(Self::Data),
            0x08 => Some(Self::Close),
            0x09 => Some(Self::Probe),
            _ => None,
        }
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Opening message from the client
    Hello {
        /// Session identifier from the pairing payload
        session_id: String,
        /// Fresh random nonce the daemon must prove it can MAC
        nonce: [u8; AUTH_NONCE_SIZE],
    },

    /// Daemon proof plus challenge
    Challenge {
        /// Fresh random nonce the client must MAC
        nonce: [u8; AUTH_NONCE_SIZE],
        /// `HMAC(auth_key, client_nonce)`
        proof: [u8; 32],
    },

    /// Client answer to the daemon's challenge
    ChallengeResponse {
        /// `HMAC(auth_key, daemon_nonce)`
        proof: [u8; 32],
    },

    /// Outcome of authentication
    AuthResult {
        /// Whether the channel is now usable
        accepted: bool,
        /// Reason if not accepted
        reason: Option<String>,
    },

    /// Keepalive ping
    Ping {
        /// Sender timestamp (ms) for latency measurement
        timestamp: u64,
    },

    /// Keepalive acknowledgment
    Pong {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// Opaque data for the session layer
    Data(Bytes),

    /// Orderly shutdown
    Close {
        /// Why the sender is closing
        reason: Option<String>,
    },

    /// Hole-punch probe
    Probe {
        /// Offer this probe belongs to
        offer_id: String,
        /// `HMAC(signaling_key, offer_id)`, proves the sender holds the pairing secret
        proof: [u8; 32],
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello { .. } => MessageType::Hello,
            Message::Challenge { .. } => MessageType::Challenge,
            Message::ChallengeResponse { .. } => MessageType::ChallengeResponse,
            Message::AuthResult { .. } => MessageType::AuthResult,
            Message::Ping { .. } => MessageType::Ping,
            Message::Pong { .. } => MessageType::Pong,
            Message::Data(_) => MessageType::Data,
            Message::Close { .. } => MessageType::Close,
            Message::Probe { .. } => MessageType::Probe,
        }
    }
}
