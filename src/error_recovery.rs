//! Retry timing for failed sync attempts.
//
// Failed syncs never lose data (nothing is deleted until the endpoint accepts
// a batch), so the only question here is how long to wait before trying again.

use std::time::Duration;

/// Exponential backoff between failed sync attempts.
///
/// The first retry waits `initial_delay`; every further consecutive failure
/// doubles the wait, capped at `max_delay`. A success resets the sequence.
///
/// # Example
///
/// ```rust
/// use wearsync::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(300));
/// assert_eq!(policy.delay_for(1), Duration::from_secs(30));
/// assert_eq!(policy.delay_for(2), Duration::from_secs(60));
/// assert_eq!(policy.delay_for(10), Duration::from_secs(300));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after the first failure.
    pub initial_delay: Duration,

    /// Upper bound for any single wait.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    /// 30 second initial delay, capped at 5 minutes.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given bounds.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt after `consecutive_failures` failures.
    ///
    /// Returns `Duration::ZERO` when there has been no failure.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let shift = (consecutive_failures - 1).min(31);
        self.initial_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Tracks consecutive failures against a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    /// Start with no recorded failures.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay_for(self.failures)
    }

    /// Clear the failure streak.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
