//! Fleet-wide singleton lock.
//!
//! Only the instance holding the lock for a queue may poll it. The lock is a
//! time-bounded lease from a [`LockCollaborator`] (an Azure blob lease in
//! production, an in-process map in tests) and must be renewed well before it
//! lapses. A lease that cannot be renewed is lost, and a lost lock ends the
//! run: the instance stops polling and never reacquires the lock in the same
//! run.
//!
//! # State machine
//!
//! ```text
//! Unlocked -> Acquiring -> Locked -> Renewing -> Locked
//!                 |                     |
//!                 v                     v
//!              Unlocked               Lost (terminal for the run)
//! ```
//!
//! A crashed holder simply stops renewing; its lease expires and another
//! instance acquires it.

use crate::config::SingletonOptions;
use crate::error::LockError;
use crate::polling::{wait_or_cancelled, PollingState};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod blob_lease;
pub mod memory;

pub use blob_lease::BlobLeaseLock;
pub use memory::InMemoryLockCollaborator;

#[cfg(test)]
#[path = "singleton_tests.rs"]
mod tests;

// ============================================================================
// Lock Token
// ============================================================================

/// Proof of a held lock, issued by a collaborator.
///
/// Expiry is tracked with `tokio::time::Instant` so lock timing can be
/// tested with a paused clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    resource_key: String,
    holder_id: String,
    lease_id: String,
    expires_at: Instant,
}

impl LockToken {
    /// Create a token for a lease that runs for `lease_duration` from now.
    ///
    /// Fails with [`LockError::Invalid`] when the expiry is not representable.
    pub fn new(
        resource_key: impl Into<String>,
        holder_id: impl Into<String>,
        lease_id: impl Into<String>,
        lease_duration: Duration,
    ) -> Result<Self, LockError> {
        let resource_key = resource_key.into();
        let expires_at = expiry_after(&resource_key, lease_duration)?;
        Ok(Self {
            resource_key,
            holder_id: holder_id.into(),
            lease_id: lease_id.into(),
            expires_at,
        })
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Collaborator-specific lease identifier
    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Check if this lease has run out
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before the lease lapses, zero if it already did
    pub fn time_remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Same lease extended to `lease_duration` from now
    pub fn renewed(&self, lease_duration: Duration) -> Result<Self, LockError> {
        Ok(Self {
            expires_at: expiry_after(&self.resource_key, lease_duration)?,
            ..self.clone()
        })
    }
}

fn expiry_after(resource_key: &str, lease_duration: Duration) -> Result<Instant, LockError> {
    Instant::now()
        .checked_add(lease_duration)
        .ok_or_else(|| LockError::Invalid {
            message: format!(
                "lease duration {:?} for '{}' is too long",
                lease_duration, resource_key
            ),
        })
}

/// Result of an acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This instance now holds the lock
    Acquired(LockToken),
    /// Another instance holds the lock. A normal outcome, not an error.
    Busy,
}

// ============================================================================
// Lock Collaborator
// ============================================================================

/// External store providing exclusive, time-bounded leases
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockCollaborator: Send + Sync {
    /// Try to take the lease on `resource_key` for `holder_id`
    async fn acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        lease_duration: Duration,
    ) -> Result<AcquireOutcome, LockError>;

    /// Extend a held lease. Returns `LockError::Lost` if it is no longer held.
    async fn renew(&self, token: &LockToken, lease_duration: Duration)
        -> Result<LockToken, LockError>;

    /// Give the lease up
    async fn release(&self, token: &LockToken) -> Result<(), LockError>;
}

// ============================================================================
// Singleton Lock
// ============================================================================

/// Lifecycle state of a [`SingletonLock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Locked,
    Renewing,
    Lost,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unlocked => "unlocked",
            Self::Acquiring => "acquiring",
            Self::Locked => "locked",
            Self::Renewing => "renewing",
            Self::Lost => "lost",
        };
        f.write_str(name)
    }
}

/// The singleton lock of one host run.
///
/// Owned by exactly one host executor; it is not shared between tasks.
pub struct SingletonLock {
    collaborator: Arc<dyn LockCollaborator>,
    resource_key: String,
    holder_id: String,
    lease_duration: Duration,
    renewal_interval: Duration,
    minimum_polling_interval: Duration,
    maximum_polling_interval: Duration,
    renewal_retry: RetryPolicy,
    state: LockState,
    token: Option<LockToken>,
}

impl SingletonLock {
    /// Create an unlocked lock for `resource_key` with a random holder id
    pub fn new(
        collaborator: Arc<dyn LockCollaborator>,
        resource_key: impl Into<String>,
        options: &SingletonOptions,
    ) -> Self {
        let lease_duration = options.lease_duration();
        Self {
            collaborator,
            resource_key: resource_key.into(),
            holder_id: uuid::Uuid::new_v4().to_string(),
            lease_duration,
            renewal_interval: options.renewal_interval(),
            minimum_polling_interval: options.minimum_polling_interval(),
            maximum_polling_interval: options.maximum_polling_interval(),
            renewal_retry: RetryPolicy::new(
                u32::MAX,
                Duration::from_millis(500),
                lease_duration / 4,
                2.0,
            ),
            state: LockState::Unlocked,
            token: None,
        }
    }

    /// Use a fixed holder identity, e.g. the host name
    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn renewal_interval(&self) -> Duration {
        self.renewal_interval
    }

    fn lost_in_run(&self) -> LockError {
        LockError::LostInRun {
            resource_key: self.resource_key.clone(),
        }
    }

    /// Try once to take the lock.
    ///
    /// Holding the lock already returns the current token. After the lock was
    /// lost this fails with `LockError::LostInRun`.
    pub async fn acquire(&mut self) -> Result<AcquireOutcome, LockError> {
        match self.state {
            LockState::Lost => return Err(self.lost_in_run()),
            LockState::Locked | LockState::Renewing => {
                if let Some(token) = &self.token {
                    return Ok(AcquireOutcome::Acquired(token.clone()));
                }
            }
            LockState::Unlocked | LockState::Acquiring => {}
        }

        self.state = LockState::Acquiring;
        let result = self
            .collaborator
            .acquire(&self.resource_key, &self.holder_id, self.lease_duration)
            .await;

        match result {
            Ok(AcquireOutcome::Acquired(token)) => {
                info!(
                    resource_key = %self.resource_key,
                    holder_id = %self.holder_id,
                    lease_id = %token.lease_id(),
                    "Singleton lock acquired"
                );
                self.state = LockState::Locked;
                self.token = Some(token.clone());
                Ok(AcquireOutcome::Acquired(token))
            }
            Ok(AcquireOutcome::Busy) => {
                debug!(resource_key = %self.resource_key, "Singleton lock held by another instance");
                self.state = LockState::Unlocked;
                Ok(AcquireOutcome::Busy)
            }
            Err(e) => {
                self.state = LockState::Unlocked;
                Err(e)
            }
        }
    }

    /// Take the lock, waiting with backoff while another instance holds it.
    ///
    /// `max_retries` bounds the attempts after the first (`None` waits
    /// indefinitely). Returns `None` when the attempts run out while the
    /// lock is busy or when `cancellation` fires.
    pub async fn acquire_with_retry(
        &mut self,
        max_retries: Option<u32>,
        cancellation: &CancellationToken,
    ) -> Result<Option<LockToken>, LockError> {
        let mut polling = PollingState::with_intervals(
            self.minimum_polling_interval,
            self.maximum_polling_interval,
            1,
        );
        let mut retries = 0u32;

        loop {
            let last_error = match self.acquire().await {
                Ok(AcquireOutcome::Acquired(token)) => return Ok(Some(token)),
                Ok(AcquireOutcome::Busy) => None,
                Err(e) if e.is_transient() => {
                    warn!(resource_key = %self.resource_key, error = %e, "Singleton lock acquisition failed");
                    Some(e)
                }
                Err(e) => return Err(e),
            };

            if max_retries.is_some_and(|max| retries >= max) {
                return match last_error {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
            retries += 1;

            let wait = polling.current_interval();
            polling = polling.next(0).0;
            info!(
                resource_key = %self.resource_key,
                retry_in_ms = wait.as_millis() as u64,
                "Waiting for singleton lock"
            );
            if !wait_or_cancelled(wait, cancellation).await {
                return Ok(None);
            }
        }
    }

    /// Renew the held lease once.
    ///
    /// A collaborator reporting the lease gone, or a transient failure after
    /// the lease already expired, moves the lock to `Lost`.
    pub async fn renew(&mut self) -> Result<LockToken, LockError> {
        if self.state == LockState::Lost {
            return Err(self.lost_in_run());
        }
        let token = match (&self.state, &self.token) {
            (LockState::Locked | LockState::Renewing, Some(token)) => token.clone(),
            _ => {
                return Err(LockError::Invalid {
                    message: format!("lock '{}' is not held", self.resource_key),
                })
            }
        };

        self.state = LockState::Renewing;
        match self.collaborator.renew(&token, self.lease_duration).await {
            Ok(renewed) => {
                debug!(resource_key = %self.resource_key, "Singleton lock renewed");
                self.state = LockState::Locked;
                self.token = Some(renewed.clone());
                Ok(renewed)
            }
            Err(e) if e.is_transient() && !token.is_expired() => {
                self.state = LockState::Locked;
                Err(e)
            }
            Err(e) => {
                error!(resource_key = %self.resource_key, error = %e, "Singleton lock lost");
                self.state = LockState::Lost;
                self.token = None;
                Err(LockError::Lost {
                    resource_key: self.resource_key.clone(),
                })
            }
        }
    }

    /// Keep the lock alive until `stop` fires.
    ///
    /// Renews every renewal interval and retries transient failures while the
    /// lease is still valid. On loss, `on_lost` is cancelled so polling stops
    /// immediately, and the loss is returned.
    pub async fn maintain(
        &mut self,
        stop: &CancellationToken,
        on_lost: &CancellationToken,
    ) -> Result<(), LockError> {
        loop {
            if !wait_or_cancelled(self.renewal_interval, stop).await {
                return Ok(());
            }

            let mut attempt = 0u32;
            loop {
                match self.renew().await {
                    Ok(_) => break,
                    Err(e) if e.is_transient() => {
                        let remaining = self.token.as_ref().map_or(Duration::ZERO, |t| t.time_remaining());
                        let delay = self.renewal_retry.calculate_delay(attempt).min(remaining);
                        attempt += 1;
                        warn!(
                            resource_key = %self.resource_key,
                            error = %e,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            "Singleton lock renewal failed; retrying"
                        );
                        if !wait_or_cancelled(delay, stop).await {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        on_lost.cancel();
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Give the lock up. Best-effort: failures are logged, and the lease
    /// then simply expires.
    pub async fn release(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        if self.state != LockState::Lost {
            self.state = LockState::Unlocked;
        }

        match self.collaborator.release(&token).await {
            Ok(()) => info!(resource_key = %self.resource_key, "Singleton lock released"),
            Err(e) => warn!(
                resource_key = %self.resource_key,
                error = %e,
                "Failed to release singleton lock; it will expire"
            ),
        }
    }
}

impl std::fmt::Debug for SingletonLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonLock")
            .field("resource_key", &self.resource_key)
            .field("holder_id", &self.holder_id)
            .field("state", &self.state)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}
