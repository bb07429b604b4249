//! # Retry Policy Module
//!
//! Exponential backoff for transient receive failures.
//!
//! The listener never gives up on a failing queue; it only spaces out its
//! attempts. A job stops once [`RetryPolicy::max_attempts`] consecutive
//! receives have failed.

use crate::error::QueueError;
use rand::Rng;
use std::time::Duration;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Retry policy configuration for exponential backoff
///
/// # Examples
///
/// ```rust
/// use queue_host_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// // Default policy: 5 attempts, 1s initial, 16s max, 2.0x multiplier
/// let policy = RetryPolicy::default();
///
/// // Custom policy
/// let policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(5), 1.5);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failures a job tolerates before stopping
    pub max_attempts: u32,

    /// Delay after the first failure
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Exponential backoff multiplier (typically 2.0)
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with ±25% jitter
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }

    /// Disable jitter
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a specific retry attempt
    ///
    /// Uses `initial * multiplier^attempt`, capped at `max_delay`, then adds
    /// jitter if enabled.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use queue_host_core::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default().without_jitter();
    /// assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
    /// ```
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::from_secs_f64(final_delay_secs)
    }

    /// Delay before retrying after `error`, honouring the error's own hint.
    ///
    /// The hint raises the delay but never past `max_delay`.
    pub fn delay_for(&self, attempt: u32, error: &QueueError) -> Duration {
        let delay = self.calculate_delay(attempt);
        match error.retry_after() {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }

    /// Check if we should retry for this attempt number
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Applies random variation in range [delay * (1-jitter), delay * (1+jitter)]
    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..=jitter_range);

        (delay_secs + jitter).max(0.0)
    }
}

/// Consecutive failure tracker for one retried operation
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Failures since the last success (0 = healthy)
    pub attempt: u32,
}

impl RetryState {
    /// Create new retry state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the delay before the next attempt, or
    /// `None` once the policy is exhausted.
    pub fn record_failure(&mut self, policy: &RetryPolicy, error: &QueueError) -> Option<Duration> {
        let delay = policy.delay_for(self.attempt, error);
        self.attempt += 1;
        policy.should_retry(self.attempt).then_some(delay)
    }

    /// Delay for the next attempt without giving up, for callers that retry
    /// indefinitely.
    pub fn record_failure_unbounded(&mut self, policy: &RetryPolicy, error: &QueueError) -> Duration {
        let delay = policy.delay_for(self.attempt, error);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after a successful attempt
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Check if any failure is outstanding
    pub fn is_failing(&self) -> bool {
        self.attempt > 0
    }
}
