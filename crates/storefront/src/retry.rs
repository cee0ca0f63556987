//! Backoff policy for reconnecting background channels.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter.
///
/// Attempt `n` (1-based) waits a random duration in `[0, min(max, base * 2^(n-1))]`,
/// floored at one millisecond. `max_attempts` of `None` retries forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the wait before attempt `attempt`.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff)
    }

    /// Randomized wait before attempt `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        let millis = rand::rng().random_range(0..=ceiling).max(1);
        Duration::from_millis(millis)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_and_caps() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_attempts: Some(5),
        };
        assert_eq!(policy.ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.ceiling(4), Duration::from_millis(800));
        assert_eq!(policy.ceiling(5), Duration::from_secs(1));
        assert_eq!(policy.ceiling(60), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_within_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 1..10 {
            let delay = policy.delay(attempt);
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= policy.ceiling(attempt));
        }
    }

    #[test]
    fn test_attempt_limit() {
        let limited = RetryPolicy {
            max_attempts: Some(3),
            ..RetryPolicy::default()
        };
        assert!(limited.allows(2));
        assert!(!limited.allows(3));
        assert!(RetryPolicy::default().allows(u32::MAX - 1));
    }
}
