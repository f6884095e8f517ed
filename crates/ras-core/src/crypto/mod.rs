//! Cryptographic primitives
//!
//! Everything the pairing core needs is derived from one [`MasterSecret`]:
//! four purpose-scoped keys (HKDF-SHA256), an AEAD codec for sealing relay
//! traffic, and HMAC-SHA256 for signatures and challenge proofs.
//!
//! [`MasterSecret`]: ras_protocol::MasterSecret

pub mod aead;
pub mod kdf;
pub mod mac;

use std::fmt;

use ras_protocol::MasterSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub use kdf::derive_key;

/// Length of every derived key
pub const KEY_SIZE: usize = 32;

/// What a derived key may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// Mutual challenge-response and LAN signaling signatures
    Auth,
    /// Sealing relay signaling envelopes
    Signaling,
    /// Sealing relayed data frames
    Encryption,
    /// Sealing address-change push notifications
    NtfyRelay,
}

impl KeyPurpose {
    /// All purposes, in a fixed order
    pub const ALL: [KeyPurpose; 4] = [
        KeyPurpose::Auth,
        KeyPurpose::Signaling,
        KeyPurpose::Encryption,
        KeyPurpose::NtfyRelay,
    ];

    /// HKDF info string
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPurpose::Auth => "auth",
            KeyPurpose::Signaling => "signaling",
            KeyPurpose::Encryption => "encryption",
            KeyPurpose::NtfyRelay => "ntfy-relay",
        }
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 32-byte key bound to one `(secret, purpose)` pair
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

impl PartialEq for DerivedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for DerivedKey {}

/// The full key set for one pairing
#[derive(Clone, Debug)]
pub struct SessionKeys {
    /// Challenge-response and LAN signaling
    pub auth: DerivedKey,
    /// Relay signaling envelopes
    pub signaling: DerivedKey,
    /// Relayed data frames
    pub encryption: DerivedKey,
    /// Address-change notifications
    pub relay: DerivedKey,
}

impl SessionKeys {
    /// Derive every purpose key from the pairing secret
    pub fn derive(secret: &MasterSecret) -> Result<Self, CryptoError> {
        let bytes = secret.expose_secret();
        Ok(Self {
            auth: derive_key(bytes, KeyPurpose::Auth.as_str())?,
            signaling: derive_key(bytes, KeyPurpose::Signaling.as_str())?,
            encryption: derive_key(bytes, KeyPurpose::Encryption.as_str())?,
            relay: derive_key(bytes, KeyPurpose::NtfyRelay.as_str())?,
        })
    }

    /// Key for a given purpose
    pub fn get(&self, purpose: KeyPurpose) -> &DerivedKey {
        match purpose {
            KeyPurpose::Auth => &self.auth,
            KeyPurpose::Signaling => &self.signaling,
            KeyPurpose::Encryption => &self.encryption,
            KeyPurpose::NtfyRelay => &self.relay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_keys_match_individual_derivation() {
        let secret = MasterSecret::from_bytes([9u8; 32]);
        let keys = SessionKeys::derive(&secret).unwrap();

        for purpose in KeyPurpose::ALL {
            let expected = derive_key(secret.expose_secret(), purpose.as_str()).unwrap();
            assert_eq!(keys.get(purpose), &expected, "purpose {}", purpose);
        }
    }

    #[test]
    fn test_session_keys_are_pairwise_distinct() {
        let keys = SessionKeys::derive(&MasterSecret::from_bytes([1u8; 32])).unwrap();
        for (i, a) in KeyPurpose::ALL.iter().enumerate() {
            for b in &KeyPurpose::ALL[i + 1..] {
                assert_ne!(keys.get(*a), keys.get(*b), "{} == {}", a, b);
            }
        }
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = DerivedKey::from_bytes([0xAA; 32]);
        assert_eq!(format!("{:?}", key), "DerivedKey(<redacted>)");
    }
}
