//! # Reconnect Backoff
//!
//! `next_delay(attempt) = min(max_interval, base_interval * 2^attempt)`.
//!
//! The pure delay is what the ceiling and monotonicity guarantees are stated
//! against. `jittered_delay` shortens it by a random fraction (never lengthens
//! it) so that many channels dropped by the same backend restart do not all
//! reconnect on the same tick.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base_interval: Duration,
    max_interval: Duration,
    jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(1_000, 30_000)
    }
}

impl BackoffPolicy {
    /// Creates a policy without jitter.
    pub fn new(base_interval_ms: u64, max_interval_ms: u64) -> Self {
        Self {
            base_interval: Duration::from_millis(base_interval_ms),
            max_interval: Duration::from_millis(max_interval_ms),
            jitter_ratio: 0.0,
        }
    }

    /// Allows each delay to be shortened by up to `ratio` (clamped to `0.0..=1.0`).
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_interval.as_millis().min(u64::MAX as u128) as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));
        delay.min(self.max_interval)
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.next_delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let cut = rand::rng().random_range(0.0..=self.jitter_ratio);
        delay.mul_f64(1.0 - cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_the_ceiling() {
        let policy = BackoffPolicy::new(1_000, 30_000);
        assert_eq!(policy.next_delay(0), Duration::from_millis(1_000));
        assert_eq!(policy.next_delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.next_delay(4), Duration::from_millis(16_000));
        assert_eq!(policy.next_delay(5), Duration::from_millis(30_000));
    }

    #[test]
    fn delay_never_exceeds_max_and_never_decreases() {
        let policy = BackoffPolicy::new(250, 45_000);
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = policy.next_delay(attempt);
            assert!(delay <= policy.max_interval(), "attempt {attempt} exceeded ceiling");
            assert!(delay >= previous, "attempt {attempt} went backwards");
            previous = delay;
        }
        assert_eq!(policy.next_delay(u32::MAX), policy.max_interval());
    }

    #[test]
    fn base_above_max_is_capped() {
        let policy = BackoffPolicy::new(5_000, 1_000);
        assert_eq!(policy.next_delay(0), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_only_shortens() {
        let policy = BackoffPolicy::new(1_000, 30_000).with_jitter(0.3);
        for attempt in 0..10 {
            let pure = policy.next_delay(attempt);
            let jittered = policy.jittered_delay(attempt);
            assert!(jittered <= pure);
            assert!(jittered >= pure.mul_f64(0.7) - Duration::from_millis(1));
        }
    }

    #[test]
    fn jitter_ratio_is_clamped() {
        assert_eq!(BackoffPolicy::default().with_jitter(7.0).jitter_ratio(), 1.0);
        assert_eq!(BackoffPolicy::default().with_jitter(-1.0).jitter_ratio(), 0.0);
        assert_eq!(BackoffPolicy::default().with_jitter(f64::NAN).jitter_ratio(), 0.0);
    }
}
