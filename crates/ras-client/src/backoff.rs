//! Backoff between resubscriptions and failed reconnection attempts

use std::time::Duration;

use rand::Rng;
use ras_core::config::BackoffConfig;

/// Growing delay, capped, with proportional jitter added on top.
///
/// The un-jittered step doubles (or grows by `multiplier`) on every
/// [`next_delay`](Self::next_delay) and goes back to `initial` on
/// [`reset`](Self::reset), which callers do after a success.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    step: Duration,
}

impl ExponentialBackoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            step: config.initial,
        }
    }

    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self::from_config(&BackoffConfig {
            initial,
            max,
            multiplier,
            jitter,
        })
    }

    /// Delay to wait now; advances the step
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.step;
        self.step = self.step.mul_f64(self.config.multiplier).min(self.config.max);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        delay + delay.mul_f64(rand::thread_rng().gen_range(0.0..=jitter))
    }

    pub fn reset(&mut self) {
        self.step = self.config.initial;
    }

    /// Un-jittered delay the next call starts from
    pub fn current(&self) -> Duration {
        self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(initial_ms: u64, max_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
            2.0,
            0.0,
        )
    }

    #[test]
    fn test_doubles_until_capped() {
        let mut backoff = steady(250, 1500);
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 1500, 1500]);
    }

    #[test]
    fn test_reset_after_success() {
        let mut backoff = ExponentialBackoff::from_config(&BackoffConfig {
            initial: Duration::from_millis(125),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.0,
        });

        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_millis(500));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(125));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
            2.0,
            0.5,
        );
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
