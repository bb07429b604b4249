//! Adaptive polling scheduler.
//!
//! After every receive the listener asks [`PollingState::next`] how long to
//! wait. A batch at or above the new-batch threshold means more work is
//! probably queued, so the next poll happens immediately and the interval
//! drops back to its minimum. A smaller batch doubles the interval up to the
//! maximum.
//!
//! The state is a plain value threaded through the loop, so the backoff can
//! be tested without a queue or a clock.

use crate::config::ListenerOptions;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "polling_tests.rs"]
mod tests;

/// Backoff state of the listener between two receives.
///
/// Invariant: `minimum <= current <= maximum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingState {
    minimum: Duration,
    maximum: Duration,
    current: Duration,
    new_batch_threshold: u32,
    last_received_count: usize,
}

/// What the scheduler does before the next receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// The queue is busy; receive again right away
    Immediate,
    /// The queue is quiet; suspend for the given duration
    Wait(Duration),
}

impl PollDecision {
    /// Duration to suspend, zero for an immediate poll
    pub fn wait(&self) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::Wait(duration) => *duration,
        }
    }
}

impl PollingState {
    /// Initial state for a listener receiving batches of `batch_size`
    pub fn new(options: &ListenerOptions, batch_size: u32) -> Self {
        Self::with_intervals(
            options.minimum_polling_interval(),
            options.maximum_polling_interval(),
            options.effective_new_batch_threshold(batch_size),
        )
    }

    /// Initial state from explicit bounds.
    ///
    /// Bounds are validated with the configuration; if they arrive swapped the
    /// maximum is raised to the minimum so the invariant still holds.
    pub fn with_intervals(minimum: Duration, maximum: Duration, new_batch_threshold: u32) -> Self {
        Self {
            minimum,
            maximum: maximum.max(minimum),
            current: minimum,
            new_batch_threshold,
            last_received_count: 0,
        }
    }

    /// Interval the next quiet cycle doubles from
    pub fn current_interval(&self) -> Duration {
        self.current
    }

    /// Lower bound of the interval
    pub fn minimum_interval(&self) -> Duration {
        self.minimum
    }

    /// Upper bound of the interval
    pub fn maximum_interval(&self) -> Duration {
        self.maximum
    }

    /// Size of the most recent batch
    pub fn last_received_count(&self) -> usize {
        self.last_received_count
    }

    /// Whether a batch of `received` messages counts as busy.
    ///
    /// An empty batch is always quiet, even with a threshold of zero, so an
    /// empty queue is never polled in a tight loop.
    pub fn is_busy(&self, received: usize) -> bool {
        received > 0 && received >= self.new_batch_threshold as usize
    }

    /// Evaluate a receive of `received` messages and return the new state
    /// together with the decision for the next poll.
    pub fn next(self, received: usize) -> (Self, PollDecision) {
        if self.is_busy(received) {
            let state = Self {
                current: self.minimum,
                last_received_count: received,
                ..self
            };
            return (state, PollDecision::Immediate);
        }

        let current = self
            .current
            .saturating_mul(2)
            .clamp(self.minimum, self.maximum);
        let state = Self {
            current,
            last_received_count: received,
            ..self
        };
        (state, PollDecision::Wait(current))
    }
}

/// Sleep for `duration` unless `cancellation` fires first.
///
/// Returns `false` when the wait was cut short by cancellation.
pub async fn wait_or_cancelled(duration: Duration, cancellation: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancellation.is_cancelled();
    }

    tokio::select! {
        _ = cancellation.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
