//! Host executor: the run loop tying leases, polling and the singleton lock
//! together.
//!
//! A run polls the queue, dispatches every received message to the handler
//! concurrently and waits for the whole batch before polling again:
//!
//! - **Job mode** drains the queue. The run ends once `max_empty_polls`
//!   consecutive receives come back empty.
//! - **Listener mode** polls until cancelled, pacing receives with the
//!   adaptive [`PollingState`].
//!
//! With singleton options the run first takes the fleet-wide lock and keeps
//! it renewed while polling. Losing it stops polling and fails the run with
//! [`HostError::LockLost`].
//!
//! Each message runs in its own task. Its lease is renewed whenever the
//! handler outlives the renewal interval. Success deletes the message;
//! failure or panic makes it visible again at once. After cancellation,
//! in-flight handlers get the shutdown grace period before they are aborted
//! and their messages left to expire.

use crate::client::QueueClient;
use crate::config::{HostConfig, LockBackendConfig, RunMode};
use crate::error::{HostError, LockError};
use crate::handler::MessageHandler;
use crate::lease::LeaseManager;
use crate::message::Message;
use crate::polling::{wait_or_cancelled, PollingState};
use crate::retry::{RetryPolicy, RetryState};
use crate::singleton::{
    BlobLeaseLock, InMemoryLockCollaborator, LockCollaborator, SingletonLock,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;

// ============================================================================
// Run Summary
// ============================================================================

/// How a run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunOutcome {
    /// Job mode found the queue empty
    #[default]
    Drained,
    /// The cancellation token fired
    Cancelled,
    /// Job-mode singleton whose lock stayed held by another instance
    LockNotAcquired,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drained => write!(f, "drained"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::LockNotAcquired => write!(f, "lock_not_acquired"),
        }
    }
}

/// Counters of a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Messages dispatched to the handler
    pub processed: u64,
    pub succeeded: u64,
    /// Handler errors and panics; each of these messages was released
    pub failed: u64,
    /// Handlers still running when the shutdown grace period ended
    pub abandoned: u64,
    /// Receive calls, including failed ones
    pub polls: u64,
    pub outcome: RunOutcome,
}

impl RunSummary {
    fn with_outcome(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            ..Self::default()
        }
    }

    fn record(&mut self, joined: Result<MessageOutcome, JoinError>) {
        match joined {
            Ok(MessageOutcome::Succeeded) => self.succeeded += 1,
            Ok(MessageOutcome::Failed) => self.failed += 1,
            Err(e) => {
                // process_message catches handler panics, so this is unexpected.
                error!(error = %e, "Message task ended abnormally");
                self.failed += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Succeeded,
    Failed,
}

// ============================================================================
// Host Executor
// ============================================================================

/// Runs a [`MessageHandler`] against one queue
pub struct HostExecutor {
    config: HostConfig,
    leases: LeaseManager,
    handler: Arc<dyn MessageHandler>,
    lock_collaborator: Option<Arc<dyn LockCollaborator>>,
    retry_policy: RetryPolicy,
}

impl HostExecutor {
    /// Create an executor. The configuration is validated here, before any
    /// receive happens.
    pub fn new(
        config: HostConfig,
        client: Arc<dyn QueueClient>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, HostError> {
        config.validate()?;
        let leases = LeaseManager::new(client, &config.host);
        Ok(Self {
            config,
            leases,
            handler,
            lock_collaborator: None,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Use this collaborator for the singleton lock instead of the one the
    /// configuration names
    pub fn with_lock_collaborator(mut self, collaborator: Arc<dyn LockCollaborator>) -> Self {
        self.lock_collaborator = Some(collaborator);
        self
    }

    /// Backoff applied after failed receives
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn lease_manager(&self) -> &LeaseManager {
        &self.leases
    }

    /// Run until the queue is drained (job mode) or `cancellation` fires.
    ///
    /// Handler failures never end the run; they are counted in the summary.
    pub async fn run(&self, cancellation: CancellationToken) -> Result<RunSummary, HostError> {
        info!(
            queue = %self.leases.queue(),
            mode = %self.config.mode,
            singleton = self.config.singleton.is_some(),
            "Host starting"
        );

        let result = if self.config.singleton.is_some() {
            self.run_singleton(&cancellation).await
        } else {
            self.poll_loop(&cancellation, &cancellation).await
        };

        match &result {
            Ok(summary) => info!(
                queue = %self.leases.queue(),
                outcome = %summary.outcome,
                processed = summary.processed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                abandoned = summary.abandoned,
                polls = summary.polls,
                "Host stopped"
            ),
            Err(e) => error!(queue = %self.leases.queue(), error = %e, "Host run failed"),
        }
        result
    }

    async fn run_singleton(&self, cancellation: &CancellationToken) -> Result<RunSummary, HostError> {
        let (Some(options), Some(resource_key)) =
            (&self.config.singleton, self.config.singleton_resource_key())
        else {
            return self.poll_loop(cancellation, cancellation).await;
        };

        let collaborator = match &self.lock_collaborator {
            Some(collaborator) => collaborator.clone(),
            None => collaborator_for(&options.lock).map_err(HostError::Lock)?,
        };
        let mut lock = SingletonLock::new(collaborator, resource_key, options);

        // A listener is a standby instance and waits for the lock indefinitely.
        let max_retries = match self.config.mode {
            RunMode::Job => Some(options.max_retries),
            RunMode::Listener => None,
        };
        let acquired = lock
            .acquire_with_retry(max_retries, cancellation)
            .await
            .map_err(HostError::Lock)?;
        if acquired.is_none() {
            let outcome = if cancellation.is_cancelled() {
                RunOutcome::Cancelled
            } else {
                info!(resource_key = %lock.resource_key(), "Singleton lock held elsewhere; not running");
                RunOutcome::LockNotAcquired
            };
            return Ok(RunSummary::with_outcome(outcome));
        }

        // Lock loss cancels polling only; in-flight handlers keep the root token.
        let poll_token = cancellation.child_token();
        let stop_renewal = CancellationToken::new();
        let polling = async {
            let summary = self.poll_loop(&poll_token, cancellation).await;
            stop_renewal.cancel();
            summary
        };
        let (renewal, summary) = tokio::join!(lock.maintain(&stop_renewal, &poll_token), polling);
        lock.release().await;

        match renewal {
            Err(e) => Err(HostError::LockLost(e)),
            Ok(()) => summary,
        }
    }

    /// Receive and dispatch until drained or `poll_token` fires.
    ///
    /// `shutdown` is handed to handlers and starts the grace period.
    async fn poll_loop(
        &self,
        poll_token: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<RunSummary, HostError> {
        let options = &self.config.host;
        let mut summary = RunSummary::default();
        let mut polling = PollingState::new(&self.config.listener, options.batch_size);
        let mut retry = RetryState::new();
        let mut empty_polls = 0u32;

        let outcome = loop {
            if poll_token.is_cancelled() {
                break RunOutcome::Cancelled;
            }

            summary.polls += 1;
            let messages = match self.leases.retrieve(options.batch_size).await {
                Ok(messages) => {
                    retry.reset();
                    messages
                }
                Err(e) if !e.is_transient() => {
                    return Err(HostError::Queue(e));
                }
                Err(e) => {
                    let delay = match self.config.mode {
                        RunMode::Job => match retry.record_failure(&self.retry_policy, &e) {
                            Some(delay) => delay,
                            None => {
                                return Err(HostError::Transport {
                                    attempts: retry.attempt,
                                    source: e,
                                })
                            }
                        },
                        RunMode::Listener => {
                            retry.record_failure_unbounded(&self.retry_policy, &e)
                        }
                    };
                    warn!(
                        queue = %self.leases.queue(),
                        operation = "receive",
                        error = %e,
                        attempt = retry.attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Receive failed; backing off"
                    );
                    if !wait_or_cancelled(delay, poll_token).await {
                        break RunOutcome::Cancelled;
                    }
                    continue;
                }
            };

            let received = messages.len();
            if received > 0 {
                empty_polls = 0;
                self.dispatch(messages, shutdown, &mut summary).await;
            } else {
                empty_polls += 1;
            }

            let (next, decision) = polling.next(received);
            polling = next;

            let wait = match self.config.mode {
                RunMode::Job if empty_polls >= options.max_empty_polls => {
                    break RunOutcome::Drained;
                }
                // Draining: keep receiving while there is work.
                RunMode::Job if received > 0 => Duration::ZERO,
                RunMode::Job | RunMode::Listener => decision.wait(),
            };
            if !wait.is_zero() {
                debug!(queue = %self.leases.queue(), wait_ms = wait.as_millis() as u64, "Queue quiet; waiting");
            }
            if !wait_or_cancelled(wait, poll_token).await {
                break RunOutcome::Cancelled;
            }
        };

        summary.outcome = outcome;
        Ok(summary)
    }

    /// Run the handler for every message of a batch and wait for all of them.
    async fn dispatch(
        &self,
        messages: Vec<Message>,
        shutdown: &CancellationToken,
        summary: &mut RunSummary,
    ) {
        let renew_every = self.config.host.lease_renewal_interval();
        let grace_period = self.config.host.shutdown_grace_period();

        let mut tasks = JoinSet::new();
        for message in messages {
            summary.processed += 1;
            tasks.spawn(process_message(
                self.leases.clone(),
                self.handler.clone(),
                message,
                shutdown.clone(),
                renew_every,
            ));
        }

        let mut grace_deadline: Option<Instant> = None;
        loop {
            let deadline = grace_deadline;
            let grace_expired = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => summary.record(joined),
                    None => break,
                },
                _ = shutdown.cancelled(), if grace_deadline.is_none() => {
                    info!(
                        in_flight = tasks.len(),
                        grace_period_ms = grace_period.as_millis() as u64,
                        "Shutdown requested; waiting for in-flight handlers"
                    );
                    grace_deadline = Some(Instant::now() + grace_period);
                }
                _ = grace_expired => {
                    let abandoned = tasks.len() as u64;
                    warn!(
                        queue = %self.leases.queue(),
                        abandoned,
                        "Shutdown grace period ended; abandoning handlers, their messages will be redelivered"
                    );
                    tasks.shutdown().await;
                    summary.abandoned += abandoned;
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for HostExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostExecutor")
            .field("mode", &self.config.mode)
            .field("leases", &self.leases)
            .field("singleton", &self.config.singleton.is_some())
            .finish()
    }
}

/// Build the lock collaborator a configuration names
pub fn collaborator_for(
    backend: &LockBackendConfig,
) -> Result<Arc<dyn LockCollaborator>, LockError> {
    Ok(match backend {
        LockBackendConfig::InMemory => Arc::new(InMemoryLockCollaborator::new()),
        LockBackendConfig::BlobLease { container_url } => {
            Arc::new(BlobLeaseLock::new(container_url)?)
        }
    })
}

/// Handle one message: invoke the handler, renew its lease while the handler
/// runs, then acknowledge or release it.
async fn process_message(
    leases: LeaseManager,
    handler: Arc<dyn MessageHandler>,
    message: Message,
    cancellation: CancellationToken,
    renew_every: Duration,
) -> MessageOutcome {
    let queue = leases.queue().clone();
    debug!(
        queue = %queue,
        message_id = %message.message_id,
        dequeue_count = message.dequeue_count(),
        "Dispatching message"
    );

    let handling = AssertUnwindSafe(handler.handle(&message, cancellation)).catch_unwind();
    tokio::pin!(handling);

    let mut renewals = interval_at(Instant::now() + renew_every, renew_every);
    renewals.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The handler keeps its view of the message; renewals may swap the receipt.
    let mut lease = message.clone();

    let result = loop {
        tokio::select! {
            result = &mut handling => break result,
            _ = renewals.tick() => {
                // Failures are logged by the lease manager; the next tick retries.
                let _ = leases.renew(&mut lease).await;
            }
        }
    };

    match result {
        Ok(Ok(())) => {
            if lease.next_visible_on.has_passed() {
                warn!(
                    queue = %queue,
                    message_id = %message.message_id,
                    "Lease expired before the handler finished; message may be delivered again"
                );
            }
            // Delete failures are logged by the lease manager.
            let _ = leases.acknowledge(&lease).await;
            MessageOutcome::Succeeded
        }
        Ok(Err(e)) => {
            error!(
                queue = %queue,
                message_id = %message.message_id,
                operation = "handle",
                error = %format!("{:#}", e),
                "Handler failed; releasing message"
            );
            let _ = leases.release(&lease).await;
            MessageOutcome::Failed
        }
        Err(panic) => {
            error!(
                queue = %queue,
                message_id = %message.message_id,
                operation = "handle",
                panic = %panic_message(panic.as_ref()),
                "Handler panicked; releasing message"
            );
            let _ = leases.release(&lease).await;
            MessageOutcome::Failed
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
