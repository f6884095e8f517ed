//! Bounded replay cache for notification nonces

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use ras_protocol::NOTIFICATION_NONCE_SIZE;

/// Number of nonces remembered by default
pub const DEFAULT_NONCE_CAPACITY: usize = 100;

type Nonce = [u8; NOTIFICATION_NONCE_SIZE];

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<Nonce>,
    seen: HashSet<Nonce>,
}

/// Remembers the most recent nonces and evicts the oldest first.
///
/// Check and insert happen under one lock, so two concurrent deliveries of
/// the same nonce cannot both be accepted.
#[derive(Debug)]
pub struct NonceCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl NonceCache {
    /// Create a cache holding at most `capacity` nonces (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::with_capacity(capacity),
                seen: HashSet::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Record `nonce`; returns `false` if it is already present.
    pub fn check_and_insert(&self, nonce: Nonce) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if !inner.seen.insert(nonce) {
            return false;
        }
        inner.order.push_back(nonce);

        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.seen.remove(&evicted);
            }
        }
        true
    }

    /// Whether `nonce` is currently cached
    pub fn contains(&self, nonce: &Nonce) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seen
            .contains(nonce)
    }

    /// Number of cached nonces
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).order.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of nonces kept
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn nonce(n: u32) -> Nonce {
        let mut bytes = [0u8; NOTIFICATION_NONCE_SIZE];
        bytes[..4].copy_from_slice(&n.to_be_bytes());
        bytes
    }

    #[test]
    fn test_rejects_duplicate() {
        let cache = NonceCache::default();
        assert!(cache.check_and_insert(nonce(1)));
        assert!(!cache.check_and_insert(nonce(1)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fifo_eviction_keeps_last_hundred() {
        let cache = NonceCache::default();
        for n in 0..150 {
            assert!(cache.check_and_insert(nonce(n)));
        }

        assert_eq!(cache.len(), 100);
        for n in 0..50 {
            assert!(!cache.contains(&nonce(n)), "nonce {} should be evicted", n);
        }
        for n in 50..150 {
            assert!(cache.contains(&nonce(n)), "nonce {} should be cached", n);
        }
    }

    #[test]
    fn test_evicted_nonce_is_accepted_again() {
        let cache = NonceCache::new(2);
        assert!(cache.check_and_insert(nonce(1)));
        assert!(cache.check_and_insert(nonce(2)));
        assert!(cache.check_and_insert(nonce(3)));
        assert!(cache.check_and_insert(nonce(1)));
        assert!(!cache.check_and_insert(nonce(3)));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = NonceCache::new(0);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.check_and_insert(nonce(1)));
        assert!(!cache.check_and_insert(nonce(1)));
    }

    #[test]
    fn test_concurrent_duplicates_accept_once() {
        let cache = Arc::new(NonceCache::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.check_and_insert(nonce(42)))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(accepted, 1);
    }
}
