//! Exponential backoff with optional jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Per-item work queue backoff: 5ms doubling up to 5 minutes, no jitter.
    pub fn for_work_queue() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(300),
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(63) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let range = delay * self.jitter;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy::default();

        let d0 = policy.delay(0);
        let d1 = policy.delay(1);
        let d2 = policy.delay(2);

        // Should increase exponentially (with some jitter variance)
        assert!(d0 < Duration::from_millis(200));
        assert!(d1 < Duration::from_millis(400));
        assert!(d2 < Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[rstest]
    #[case(0, 5)]
    #[case(1, 10)]
    #[case(4, 80)]
    #[case(16, 300_000)]
    fn test_work_queue_backoff_doubles(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = BackoffPolicy::for_work_queue();
        assert_eq!(policy.delay(attempt), Duration::from_millis(expected_ms));
    }
}
