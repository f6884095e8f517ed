//! Signatures for the LAN signaling exchange
//!
//! Requests and responses carry `x-ras-timestamp` and `x-ras-signature`
//! headers where the signature is
//! `hex(HMAC(auth_key, session_id || be64(timestamp) || body))`.

use thiserror::Error;

use crate::crypto::{mac, DerivedKey};
use crate::time::within_window;

/// Default accepted clock skew, in seconds
pub const TIMESTAMP_TOLERANCE_SECS: u64 = 300;

/// Why a signed request or response was refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Timestamp outside the accepted window
    #[error("timestamp outside accepted window")]
    Stale,

    /// Signature header is not valid hex
    #[error("malformed signature")]
    Malformed,

    /// Signature does not match
    #[error("signature mismatch")]
    BadSignature,
}

/// Compute the hex signature for a signaling message
pub fn sign(auth_key: &DerivedKey, session_id: &str, timestamp: u64, body: &[u8]) -> String {
    hex::encode(mac::compute_parts(
        auth_key.as_bytes(),
        &[session_id.as_bytes(), &timestamp.to_be_bytes(), body],
    ))
}

/// Check a signaling message's timestamp and signature.
///
/// The timestamp is checked first so stale traffic is refused without
/// touching the MAC.
pub fn verify(
    auth_key: &DerivedKey,
    session_id: &str,
    timestamp: u64,
    body: &[u8],
    signature: &str,
    now: u64,
    tolerance_secs: u64,
) -> Result<(), SignatureError> {
    if !within_window(timestamp, now, tolerance_secs) {
        return Err(SignatureError::Stale);
    }

    let tag = hex::decode(signature).map_err(|_| SignatureError::Malformed)?;
    if mac::verify_parts(
        auth_key.as_bytes(),
        &[session_id.as_bytes(), &timestamp.to_be_bytes(), body],
        &tag,
    ) {
        Ok(())
    } else {
        Err(SignatureError::BadSignature)
    }
}
