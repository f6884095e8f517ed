//! HMAC-SHA256 helpers

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of an HMAC-SHA256 tag
pub const TAG_SIZE: usize = 32;

fn keyed(key: &[u8]) -> HmacSha256 {
    // HMAC is defined for keys of any length
    <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length")
}

/// Compute `HMAC-SHA256(key, message)`
pub fn compute(key: &[u8], message: &[u8]) -> [u8; TAG_SIZE] {
    compute_parts(key, &[message])
}

/// Compute the tag over the concatenation of `parts`
pub fn compute_parts(key: &[u8], parts: &[&[u8]]) -> [u8; TAG_SIZE] {
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Verify `tag` in constant time
pub fn verify(key: &[u8], message: &[u8], tag: &[u8]) -> bool {
    verify_parts(key, &[message], tag)
}

/// Verify a tag over the concatenation of `parts` in constant time
pub fn verify_parts(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4231_case_2() {
        let tag = compute(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_deterministic_and_key_sensitive() {
        let a = compute(b"key one", b"message");
        assert_eq!(a, compute(b"key one", b"message"));
        assert_ne!(a, compute(b"key two", b"message"));
    }

    #[test]
    fn test_verify() {
        let tag = compute(b"key", b"message");
        assert!(verify(b"key", b"message", &tag));
        assert!(!verify(b"key", b"massage", &tag));
        assert!(!verify(b"other", b"message", &tag));
        assert!(!verify(b"key", b"message", &tag[..16]));
    }

    #[test]
    fn test_parts_equal_concatenation() {
        let whole = compute(b"key", b"session-1\x00\x00\x00\x00\x00\x00\x00\x2abody");
        let parts = compute_parts(
            b"key",
            &[b"session-1", &42u64.to_be_bytes(), b"body"],
        );
        assert_eq!(whole, parts);
        assert!(verify_parts(
            b"key",
            &[b"session-1", &42u64.to_be_bytes(), b"body"],
            &whole
        ));
    }
}
