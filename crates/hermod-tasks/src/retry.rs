//! Retry policy configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first failure
    pub max_retries: u32,
    /// Base delay before the first retry
    pub retry_delay: Duration,
    /// Multiplier applied to the delay each retry (e.g. 2.0 for 1s, 2s, 4s)
    pub backoff_multiplier: f64,
    /// Cap on the computed delay
    pub max_delay: Duration,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Fixed delay between retries
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay: delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Exponential backoff doubling from `retry_delay` up to `max_delay`
    pub fn exponential(max_retries: u32, retry_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            backoff_multiplier: 2.0,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry attempt `attempt` (1-based).
    ///
    /// `delay = retry_delay * multiplier^(attempt-1)`, capped at `max_delay`,
    /// with up to 25% jitter added when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.retry_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            capped * (1.0 + rand_jitter() * 0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures so far
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Jitter factor in [0, 1) derived from the clock's sub-second noise
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_no_retry() {
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy =
            RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(10));
    }

    #[test]
    fn test_attempt_zero_is_immediate() {
        assert_eq!(
            RetryPolicy::default().delay_for_attempt(0),
            Duration::ZERO
        );
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::fixed(3, Duration::from_secs(4))
        };
        for _ in 0..20 {
            let d = policy.delay_for_attempt(1);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_secs(5));
        }
    }
}
