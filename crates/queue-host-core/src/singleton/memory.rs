//! In-process lock collaborator.
//!
//! Implements the same acquire/renew/release contract as the blob lease, with
//! expiry checked on every call. Several [`SingletonLock`]s sharing one
//! collaborator behave like instances of a fleet sharing one lock store.
//!
//! [`SingletonLock`]: super::SingletonLock

use super::{AcquireOutcome, LockCollaborator, LockToken};
use crate::error::LockError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Shared map of resource key to current lease
#[derive(Clone, Default)]
pub struct InMemoryLockCollaborator {
    leases: Arc<RwLock<HashMap<String, LockToken>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLockCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a transport error until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop the lease on `resource_key`, as if it expired or was broken
    ///
    /// ```
    /// use queue_host_core::{InMemoryLockCollaborator, LockCollaborator};
    /// use std::time::Duration;
    ///
    /// # tokio_test::block_on(async {
    /// let locks = InMemoryLockCollaborator::new();
    /// locks.acquire("orders", "instance-a", Duration::from_secs(30)).await.unwrap();
    ///
    /// assert!(locks.break_lease("orders").await);
    /// assert_eq!(locks.holder("orders").await, None);
    /// # });
    /// ```
    pub async fn break_lease(&self, resource_key: &str) -> bool {
        self.leases.write().await.remove(resource_key).is_some()
    }

    /// Holder of the unexpired lease on `resource_key`, if any
    pub async fn holder(&self, resource_key: &str) -> Option<String> {
        self.leases
            .read()
            .await
            .get(resource_key)
            .filter(|lease| !lease.is_expired())
            .map(|lease| lease.holder_id().to_string())
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Transport {
                message: "lock store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryLockCollaborator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLockCollaborator")
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl LockCollaborator for InMemoryLockCollaborator {
    async fn acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        lease_duration: Duration,
    ) -> Result<AcquireOutcome, LockError> {
        self.check_available()?;
        let mut leases = self.leases.write().await;

        if let Some(existing) = leases.get(resource_key) {
            if !existing.is_expired() {
                if existing.holder_id() != holder_id {
                    return Ok(AcquireOutcome::Busy);
                }
                // Same holder asking again gets its lease back, extended.
                let renewed = existing.renewed(lease_duration)?;
                leases.insert(resource_key.to_string(), renewed.clone());
                return Ok(AcquireOutcome::Acquired(renewed));
            }
        }

        let token = LockToken::new(
            resource_key,
            holder_id,
            uuid::Uuid::new_v4().to_string(),
            lease_duration,
        )?;
        leases.insert(resource_key.to_string(), token.clone());
        Ok(AcquireOutcome::Acquired(token))
    }

    async fn renew(&self, token: &LockToken, lease_duration: Duration) -> Result<LockToken, LockError> {
        self.check_available()?;
        let mut leases = self.leases.write().await;

        match leases.get(token.resource_key()) {
            Some(current) if current.lease_id() == token.lease_id() && !current.is_expired() => {
                let renewed = current.renewed(lease_duration)?;
                leases.insert(token.resource_key().to_string(), renewed.clone());
                Ok(renewed)
            }
            _ => Err(LockError::Lost {
                resource_key: token.resource_key().to_string(),
            }),
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        self.check_available()?;
        let mut leases = self.leases.write().await;

        // Never remove a lease someone else has taken since.
        if leases
            .get(token.resource_key())
            .is_some_and(|current| current.lease_id() == token.lease_id())
        {
            leases.remove(token.resource_key());
        }
        Ok(())
    }
}
