//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Exponential backoff for automatic retries and broker/store outages.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// `delay = min(base_delay * multiplier^(attempt - 1), max_delay)`
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 16)]
    fn exponential_backoff_increases(#[case] attempt: u32, #[case] secs: u64) {
        let policy = RetryPolicy::new(Duration::from_secs(2), 2.0, Duration::from_secs(60));
        assert_eq!(policy.next_delay(attempt), Duration::from_secs(secs));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 2.0, Duration::from_secs(10));
        assert_eq!(policy.next_delay(10), Duration::from_secs(10));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }
}
