use std::time::Duration;

/// Reconnect schedule for the price stream.
///
/// Delays double per attempt up to `max_delay`. An unbounded policy retries
/// forever; a bounded one gives up after `max_attempts` failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Constant delay with no backoff.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            max_attempts: None,
        }
    }

    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: None,
        }
    }

    pub fn bounded(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` when
    /// the policy is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        Some(backoff.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::with_backoff(Duration::from_secs(2), Duration::from_secs(60));
        assert_eq!(policy.delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay(10), Some(Duration::from_secs(60)));
    }

    #[test]
    fn fixed_policy_never_backs_off() {
        let policy = RetryPolicy::fixed(Duration::from_secs(2));
        assert_eq!(policy.delay(1), policy.delay(7));
    }

    #[test]
    fn bounded_policy_gives_up() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).bounded(3);
        assert!(policy.delay(3).is_some());
        assert_eq!(policy.delay(4), None);
    }

    #[test]
    fn large_attempt_does_not_overflow() {
        let policy = RetryPolicy::with_backoff(Duration::from_secs(2), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Some(Duration::from_secs(60)));
    }
}
