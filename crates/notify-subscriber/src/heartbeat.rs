//! Liveness watchdog for streams that stay open but stop delivering frames.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

/// Tracks the last sign of life on a connection and decides when it has stalled.
///
/// Uses the monotonic clock, so wall-clock steps cannot trigger or mask a stall.
#[derive(Debug)]
pub(crate) struct Watchdog {
    timeout: Duration,
    last_beat: Instant,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_beat: Instant::now(),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    pub fn beat(&mut self) {
        self.last_beat = Instant::now();
    }

    /// Returns the idle time if it exceeds the timeout.
    pub fn stalled(&self, now: Instant) -> Option<Duration> {
        if !self.enabled() {
            return None;
        }
        let idle = now.saturating_duration_since(self.last_beat);
        (idle > self.timeout).then_some(idle)
    }

    /// Check interval: a third of the timeout, never more often than once a second.
    pub fn check_interval(&self) -> Duration {
        (self.timeout / 3).max(MIN_CHECK_INTERVAL)
    }

    /// Builds the periodic check timer. The first tick fires one interval from now.
    pub fn ticker(&self) -> Option<Interval> {
        if !self.enabled() {
            return None;
        }
        let period = self.check_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_interval_is_a_third_with_floor() {
        assert_eq!(
            Watchdog::new(Duration::from_secs(45)).check_interval(),
            Duration::from_secs(15)
        );
        assert_eq!(
            Watchdog::new(Duration::from_millis(1500)).check_interval(),
            Duration::from_millis(1000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_only_after_timeout() {
        let mut dog = Watchdog::new(Duration::from_secs(45));
        assert!(dog.stalled(Instant::now()).is_none());

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(dog.stalled(Instant::now()).is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(
            dog.stalled(Instant::now()),
            Some(Duration::from_millis(45_001))
        );

        dog.beat();
        assert!(dog.stalled(Instant::now()).is_none());
    }

    #[test]
    fn zero_timeout_disables() {
        let dog = Watchdog::new(Duration::ZERO);
        assert!(!dog.enabled());
        assert!(dog.stalled(Instant::now() + Duration::from_secs(3600)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_fires_on_period() {
        let dog = Watchdog::new(Duration::from_secs(3));
        let mut ticker = dog.ticker().unwrap();
        let start = Instant::now();
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
