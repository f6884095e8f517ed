//! Sealing values for the relay
//!
//! Relay messages are `base64(nonce || ciphertext || tag)` of a JSON value,
//! sealed with a purpose key: `ntfy-relay` for address-change notifications,
//! `signaling` for signaling envelopes.

use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use ras_protocol::{IpChangeNotification, SignalEnvelope, NOTIFICATION_NONCE_SIZE};
use thiserror::Error;

use crate::crypto::{aead, DerivedKey};
use crate::error::{ConnectionError, CryptoError};

/// Why a relay message could not be opened
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// Not base64
    #[error("message is not valid base64")]
    InvalidBase64,

    /// Too short to hold a nonce and a tag
    #[error("message too short to be sealed")]
    Undersized,

    /// Tag did not verify
    #[error("message failed authentication")]
    Authentication,

    /// Decrypted fine but is not the expected JSON
    #[error("decrypted message is malformed")]
    Malformed,
}

fn seal_bytes(key: &DerivedKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    Ok(STANDARD.encode(aead::encode(key, plaintext)?))
}

fn open_bytes(key: &DerivedKey, text: &str) -> Result<Vec<u8>, OpenError> {
    let sealed = STANDARD
        .decode(text.trim())
        .map_err(|_| OpenError::InvalidBase64)?;
    if sealed.len() < aead::MIN_SEALED_SIZE {
        return Err(OpenError::Undersized);
    }
    aead::decode(key, &sealed).map_err(|_| OpenError::Authentication)
}

/// Build a notification for `addr` with a fresh random nonce
pub fn new_notification(addr: SocketAddr, timestamp: u64) -> IpChangeNotification {
    let mut nonce = [0u8; NOTIFICATION_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    IpChangeNotification {
        ip: addr.ip(),
        port: addr.port(),
        timestamp,
        nonce,
    }
}

/// Seal an address-change notification with the `ntfy-relay` key
pub fn seal_notification(
    key: &DerivedKey,
    notification: &IpChangeNotification,
) -> Result<String, ConnectionError> {
    Ok(seal_bytes(key, &notification.to_json()?)?)
}

/// Open an address-change notification
pub fn open_notification(key: &DerivedKey, text: &str) -> Result<IpChangeNotification, OpenError> {
    let plaintext = open_bytes(key, text)?;
    IpChangeNotification::from_json(&plaintext).map_err(|_| OpenError::Malformed)
}

/// Seal a signaling envelope with the `signaling` key
pub fn seal_envelope(key: &DerivedKey, envelope: &SignalEnvelope) -> Result<String, ConnectionError> {
    Ok(seal_bytes(key, &envelope.to_json()?)?)
}

/// Open a signaling envelope
pub fn open_envelope(key: &DerivedKey, text: &str) -> Result<SignalEnvelope, OpenError> {
    let plaintext = open_bytes(key, text)?;
    SignalEnvelope::from_json(&plaintext).map_err(|_| OpenError::Malformed)
}

/// Seal an encoded protocol frame with the `encryption` key
pub fn seal_frame(key: &DerivedKey, frame: &[u8]) -> Result<String, CryptoError> {
    seal_bytes(key, frame)
}

/// Open a sealed protocol frame
pub fn open_frame(key: &DerivedKey, text: &str) -> Result<Vec<u8>, OpenError> {
    open_bytes(key, text)
}
