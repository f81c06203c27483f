//! Exponential backoff with jitter for delivery retries.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay ceiling after the first failure, in milliseconds.
    pub base_ms: u64,
    /// Upper bound for the delay ceiling, in milliseconds.
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

/// Retry delay generator.
///
/// The ceiling doubles on each consecutive failure (`base * 2^n`, capped at
/// `max`). The returned delay uses "equal jitter": half the ceiling plus a
/// random share of the other half, so retries from many clients spread out
/// without ever collapsing to zero.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the delay before the next retry and advances the attempt count.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..=1.0);
        self.next_delay_with(jitter)
    }

    /// Like [`Backoff::next_delay`] with a caller-supplied jitter in `[0, 1]`.
    pub fn next_delay_with(&mut self, jitter: f64) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let half = ceiling / 2;
        half + half.mul_f64(jitter.clamp(0.0, 1.0))
    }

    /// Resets to the base delay after a successful delivery.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures since the last reset.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    fn ceiling(&self) -> Duration {
        let factor = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        let ms = self
            .config
            .base_ms
            .saturating_mul(factor)
            .min(self.config.max_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(BackoffConfig {
            base_ms: 100,
            max_ms: 1_000,
        })
    }

    #[test]
    fn doubles_until_capped() {
        let mut backoff = backoff();
        let ceilings: Vec<u128> = (0..6)
            .map(|_| backoff.next_delay_with(1.0).as_millis())
            .collect();
        assert_eq!(ceilings, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn jitter_keeps_at_least_half_the_ceiling() {
        let mut backoff = backoff();
        assert_eq!(backoff.next_delay_with(0.0), Duration::from_millis(50));

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = backoff();
        backoff.next_delay_with(1.0);
        backoff.next_delay_with(1.0);
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay_with(1.0), Duration::from_millis(100));
    }

    #[test]
    fn survives_many_failures() {
        let mut backoff = backoff();
        for _ in 0..200 {
            backoff.next_delay_with(0.5);
        }
        assert_eq!(backoff.next_delay_with(1.0), Duration::from_millis(1_000));
    }
}
