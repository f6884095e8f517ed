//! Purpose-scoped key derivation (HKDF-SHA256)

use hkdf::Hkdf;
use sha2::Sha256;

use super::{DerivedKey, KEY_SIZE};
use crate::error::CryptoError;

/// Derive a 32-byte key for `purpose` from `secret`.
///
/// HKDF-SHA256 with an empty salt and the UTF-8 purpose as info. The same
/// `(secret, purpose)` always yields the same key; distinct purposes yield
/// independent keys.
///
/// # Errors
/// [`CryptoError::EmptySecret`] if `secret` is empty.
pub fn derive_key(secret: &[u8], purpose: &str) -> Result<DerivedKey, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::EmptySecret);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(&[]), secret);
    let mut okm = [0u8; KEY_SIZE];
    // 32 bytes is far below HKDF's 255 * HashLen limit
    hkdf.expand(purpose.as_bytes(), &mut okm)
        .map_err(|_| CryptoError::InvalidKey)?;

    Ok(DerivedKey::from_bytes(okm))
}
