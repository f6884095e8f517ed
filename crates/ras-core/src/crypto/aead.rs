//! Authenticated codec (AES-256-GCM)
//!
//! Output layout: `nonce (12) || ciphertext || tag (16)`. A fresh random nonce
//! is drawn for every call, so identical plaintexts never encode identically.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use super::DerivedKey;
use crate::error::CryptoError;

/// AES-GCM nonce length
pub const NONCE_SIZE: usize = 12;

/// AES-GCM tag length
pub const TAG_SIZE: usize = 16;

/// Smallest input [`decode`] will even try to open
pub const MIN_SEALED_SIZE: usize = NONCE_SIZE + TAG_SIZE;

/// Encrypt and authenticate `plaintext` under `key`
pub fn encode(key: &DerivedKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Verify and decrypt a value produced by [`encode`].
///
/// Never returns partial output: any failure is [`CryptoError::Authentication`].
pub fn decode(key: &DerivedKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < MIN_SEALED_SIZE {
        return Err(CryptoError::Authentication);
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}
