//! Reconnect delay policy: exponential growth with bounded jitter.

use std::time::Duration;

use rand::Rng;

use crate::types::{DEFAULT_JITTER_RATIO, DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY};

/// Maps a failure count to a reconnect delay.
///
/// `delay(n) = min(max_delay, min_delay * 2^(n-1)) * (1 + U(0, jitter_ratio))`,
/// clamped to `max_delay`. The policy is stateless; the controller owns the
/// attempt counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt`, with fresh random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit: f64 = rand::thread_rng().r#gen();
        self.delay_with(attempt, unit)
    }

    /// Deterministic variant of [`delay`](Self::delay): `unit` in `[0, 1]` selects
    /// how much of the jitter range is applied.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        // 2^30 already saturates any sane max_delay.
        let exp = attempt.saturating_sub(1).min(30);
        let base = self
            .min_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter = self.jitter_ratio.max(0.0) * unit.clamp(0.0, 1.0);
        Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Lower bound of [`delay`](Self::delay) for `attempt`.
    pub fn floor(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn doubles_from_min_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_with(1, 0.0), ms(1000));
        assert_eq!(policy.delay_with(2, 0.0), ms(2000));
        assert_eq!(policy.delay_with(3, 0.0), ms(4000));
        assert_eq!(policy.delay_with(5, 0.0), ms(16_000));
    }

    #[test]
    fn full_jitter_adds_ratio() {
        let policy = BackoffPolicy::default();
        let close = |a: Duration, b: Duration| a.abs_diff(b) < ms(1);
        assert!(close(policy.delay_with(1, 1.0), ms(1330)));
        assert!(close(policy.delay_with(3, 0.5), ms(4660)));
    }

    #[test]
    fn never_exceeds_max_delay() {
        let policy = BackoffPolicy::default();
        for attempt in 1..64 {
            for unit in [0.0, 0.25, 0.5, 1.0] {
                assert!(policy.delay_with(attempt, unit) <= ms(30_000));
            }
        }
        assert_eq!(policy.delay_with(6, 0.0), ms(30_000));
        assert_eq!(policy.delay_with(u32::MAX, 1.0), ms(30_000));
    }

    #[test]
    fn random_delays_stay_in_bounds() {
        let policy = BackoffPolicy::default();
        for attempt in 1..12u32 {
            for _ in 0..50 {
                let d = policy.delay(attempt);
                assert!(d >= policy.floor(attempt), "attempt {attempt}: {d:?}");
                assert!(d <= policy.max_delay.mul_f64(1.0 + policy.jitter_ratio));
            }
        }
    }

    #[test]
    fn consecutive_failures_are_non_decreasing() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let delays: Vec<Duration> = (1..=5).map(|a| policy.delay(a)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
            assert!(delays.iter().all(|d| *d <= ms(39_900)));
        }
    }

    #[test]
    fn attempt_zero_uses_min_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_with(0, 0.0), ms(1000));
    }

    #[test]
    fn nonsense_inputs_fall_back_to_bounds() {
        let policy = BackoffPolicy {
            min_delay: ms(100),
            max_delay: ms(1000),
            jitter_ratio: f64::NAN,
        };
        assert_eq!(policy.delay_with(1, 0.7), ms(100));
        assert_eq!(policy.delay_with(1, f64::NAN), ms(1000));
    }
}
