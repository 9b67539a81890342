//! Retry policy: decides backoff delays.

use std::time::Duration;

use crate::domain::TaskConfig;

/// Delay before a failed attempt is re-queued.
///
/// `delay = base_delay * multiplier^(retry - 1)`. Tasks get `multiplier = 1.0`
/// (a flat `retry_delay`). `TaskWorker` backs off consecutive store errors
/// with a doubling policy capped at `max_error_backoff`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Flat delay taken from the task's `retry_delay`.
    pub fn for_task(config: &TaskConfig) -> Self {
        Self::fixed(config.retry_delay)
    }

    /// Delay before retry number `retry` (1-indexed; 0 is treated as 1).
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn task_policy_is_flat() {
        let config = TaskConfig::default().with_retries(3, Duration::from_millis(250));
        let policy = RetryPolicy::for_task(&config);

        assert_eq!(policy.next_delay(1), Duration::from_millis(250));
        assert_eq!(policy.next_delay(3), Duration::from_millis(250));
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 10)]
    #[case(60, 10)]
    fn exponential_backoff_is_capped(#[case] retry: u32, #[case] expected_secs: u64) {
        let policy =
            RetryPolicy::exponential(Duration::from_secs(2), 2.0, Duration::from_secs(10));
        assert_eq!(policy.next_delay(retry), Duration::from_secs(expected_secs));
    }
}
