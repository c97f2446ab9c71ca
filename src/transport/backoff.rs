use std::cmp::min;
use std::time::Duration;
use tokio::time::Instant;

/// Schedules retransmits of a single packet: the interval starts at `initial` and grows by
///  `factor_eighths / 8` per attempt, capped at `max`.
#[derive(Clone, Debug)]
pub struct RetransmitBackoff {
    attempts: u32,
    interval: Duration,
    next_at: Instant,

    config_max: Duration,
    config_factor_eighths: u32,
}

impl RetransmitBackoff {
    pub const DEFAULT_FACTOR_EIGHTHS: u32 = 8*2;

    pub fn new(now: Instant, initial: Duration, max: Duration) -> RetransmitBackoff {
        Self::with_factor(now, initial, max, Self::DEFAULT_FACTOR_EIGHTHS)
    }

    pub fn with_factor(now: Instant, initial: Duration, max: Duration, factor_eighths: u32) -> RetransmitBackoff {
        assert!(factor_eighths >= 8);

        RetransmitBackoff {
            attempts: 0,
            interval: initial,
            next_at: now + initial,
            config_max: max,
            config_factor_eighths: factor_eighths,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_at(&self) -> Instant {
        self.next_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_at
    }

    /// Registers a retransmit at `now` and schedules the next one.
    pub fn on_retransmit(&mut self, now: Instant) {
        self.attempts += 1;
        self.interval = min(self.interval * self.config_factor_eighths / 8, self.config_max);
        self.next_at = now + self.interval;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use tokio::time::Instant;
    use super::*;

    #[rstest]
    #[case::doubling(100, 2000, 16, 0, 100)]
    #[case::doubling_1(100, 2000, 16, 1, 200)]
    #[case::doubling_3(100, 2000, 16, 3, 800)]
    #[case::capped(100, 2000, 16, 5, 2000)]
    #[case::capped_later(100, 2000, 16, 12, 2000)]
    #[case::factor_1_5(100, 2000, 12, 1, 150)]
    #[case::factor_1_5_2(100, 2000, 12, 2, 225)]
    #[case::constant(100, 2000, 8, 7, 100)]
    fn test_interval_after_retransmits(
        #[case] initial_millis: u64,
        #[case] max_millis: u64,
        #[case] factor_eighths: u32,
        #[case] num_retransmits: u32,
        #[case] expected_millis: u64,
    ) {
        let start = Instant::now();
        let mut backoff = RetransmitBackoff::with_factor(start, Duration::from_millis(initial_millis), Duration::from_millis(max_millis), factor_eighths);

        let mut now = start;
        for _ in 0..num_retransmits {
            now = backoff.next_at();
            backoff.on_retransmit(now);
        }

        assert_eq!(backoff.attempts(), num_retransmits);
        assert_eq!(backoff.next_at() - now, Duration::from_millis(expected_millis));
    }

    #[test]
    fn test_is_due() {
        let start = Instant::now();
        let backoff = RetransmitBackoff::new(start, Duration::from_millis(100), Duration::from_secs(1));
        assert!(!backoff.is_due(start));
        assert!(!backoff.is_due(start + Duration::from_millis(99)));
        assert!(backoff.is_due(start + Duration::from_millis(100)));
    }
}
