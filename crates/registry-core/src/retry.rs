//! Exponential backoff retry policy.

use std::time::Duration;

use rand::Rng;

/// Highest retry count before the backoff shift would overflow.
const MAX_RETRIES_LIMIT: u32 = 29;

/// Retry policy that sleeps a random, exponentially growing number of base
/// intervals between attempts, capped at `max_sleep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base_sleep: Duration,
    max_retries: u32,
    max_sleep: Duration,
}

impl ExponentialBackoff {
    /// Create a new policy. `max_retries` is clamped to 29.
    #[must_use]
    pub fn new(base_sleep: Duration, max_retries: u32, max_sleep: Duration) -> Self {
        if max_retries > MAX_RETRIES_LIMIT {
            tracing::warn!(
                max_retries,
                limit = MAX_RETRIES_LIMIT,
                "max_retries too large, clamping"
            );
        }
        Self {
            base_sleep,
            max_retries: max_retries.min(MAX_RETRIES_LIMIT),
            max_sleep,
        }
    }

    #[must_use]
    pub const fn base_sleep(&self) -> Duration {
        self.base_sleep
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub const fn max_sleep(&self) -> Duration {
        self.max_sleep
    }

    /// Whether attempt number `retry_count` (zero based) may be retried.
    #[must_use]
    pub const fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Backoff before retry `retry_count`, or `None` once retries are exhausted.
    #[must_use]
    pub fn sleep_for(&self, retry_count: u32) -> Option<Duration> {
        if !self.allows_retry(retry_count) {
            return None;
        }
        let upper = 1u32 << (retry_count + 1).min(MAX_RETRIES_LIMIT + 1);
        let factor = rand::thread_rng().gen_range(1..upper).max(1);
        Some(self.base_sleep.saturating_mul(factor).min(self.max_sleep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_is_bounded() {
        let policy =
            ExponentialBackoff::new(Duration::from_millis(10), 5, Duration::from_millis(50));
        for retry in 0..5 {
            let sleep = policy.sleep_for(retry).unwrap();
            assert!(sleep >= Duration::from_millis(10));
            assert!(sleep <= Duration::from_millis(50));
        }
        assert!(policy.sleep_for(5).is_none());
    }

    #[test]
    fn test_first_retry_sleeps_base() {
        let policy =
            ExponentialBackoff::new(Duration::from_millis(100), 3, Duration::from_secs(10));
        // 1 << 1 gives the range 1..2, so the factor is always 1.
        assert_eq!(policy.sleep_for(0), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_zero_retries() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), 0, Duration::from_secs(1));
        assert!(!policy.allows_retry(0));
        assert!(policy.sleep_for(0).is_none());
    }

    #[test]
    fn test_max_retries_clamped() {
        let policy = ExponentialBackoff::new(Duration::from_millis(1), 100, Duration::from_secs(1));
        assert_eq!(policy.max_retries(), 29);
        assert!(policy.sleep_for(28).is_some());
    }
}
