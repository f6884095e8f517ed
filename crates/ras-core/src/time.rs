//! Wall-clock helpers
//!
//! Notification freshness and signaling signatures both compare Unix
//! timestamps in seconds; keepalive round trips are measured in millis.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time since the Unix epoch.
///
/// # Panics
/// Panics if the clock reads earlier than 1970-01-01.
fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
}

/// Unix time in milliseconds
pub fn current_time_millis() -> u64 {
    since_epoch().as_millis() as u64
}

/// Unix time in seconds, as carried in notifications and signaling headers
pub fn current_time_secs() -> u64 {
    since_epoch().as_secs()
}

/// Milliseconds since `since` (a [`current_time_millis`] reading); 0 if it is ahead of us
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}

/// Whether `timestamp` lies within `tolerance_secs` of `now`, in either direction.
///
/// Both bounds are inclusive.
///
/// ```
/// use ras_core::time::within_window;
///
/// assert!(within_window(1_000, 1_300, 300));
/// assert!(!within_window(1_000, 1_301, 300));
/// ```
pub fn within_window(timestamp: u64, now: u64, tolerance_secs: u64) -> bool {
    timestamp.abs_diff(now) <= tolerance_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_and_millis_agree() {
        let millis = current_time_millis();
        let secs = current_time_secs();
        assert!(secs.abs_diff(millis / 1000) <= 1);
    }

    #[test]
    fn test_elapsed_never_negative() {
        let start = current_time_millis();
        std::thread::sleep(Duration::from_millis(10));
        assert!(elapsed_millis(start) >= 10);
        assert_eq!(elapsed_millis(current_time_millis() + 60_000), 0);
    }

    #[test]
    fn test_within_window_edges() {
        let now = 1_700_000_000;
        assert!(within_window(now, now, 300));
        assert!(within_window(now - 300, now, 300));
        assert!(within_window(now + 300, now, 300));
        assert!(!within_window(now - 301, now, 300));
        assert!(!within_window(now + 301, now, 300));
        assert!(!within_window(0, now, 300));
    }
}
