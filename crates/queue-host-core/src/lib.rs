//! # Queue Host Core
//!
//! Turns a cloud message queue into an at-least-once execution trigger for a
//! user-supplied handler.
//!
//! This library provides:
//! - Message leases: receive, renew, acknowledge and release
//! - Adaptive polling that backs off while the queue is quiet
//! - A fleet-wide singleton lock backed by blob leases
//! - A host executor running handlers in job or listener mode
//!
//! ## Module Organization
//!
//! - [error] - Error types for queue, lock and host operations
//! - [message] - Message structures, receipt handles and timestamps
//! - [provider] / [providers] - Provider configuration and implementations
//! - [client] - The queue client adapter trait
//! - [lease] - Lease bookkeeping over the client
//! - [polling] - Listener backoff state
//! - [singleton] - Singleton lock and its collaborators
//! - [handler] / [host] - Handler contract and run loop

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod host;
pub mod lease;
pub mod message;
pub mod polling;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod singleton;

pub use client::{DeleteOutcome, QueueClient, QueueClientFactory};
pub use config::{
    HostConfig, HostOptions, ListenerOptions, LockBackendConfig, RunMode, SingletonOptions,
};
pub use error::{ConfigurationError, HostError, LockError, QueueError, ValidationError};
pub use handler::{FnHandler, MessageHandler};
pub use host::{HostExecutor, RunOutcome, RunSummary};
pub use lease::LeaseManager;
pub use message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp};
pub use polling::{PollDecision, PollingState};
pub use provider::{AwsSqsConfig, AzureQueueConfig, ProviderConfig, ProviderType};
pub use providers::{AwsSqsProvider, AzureQueueProvider, InMemoryProvider};
pub use retry::{RetryPolicy, RetryState};
pub use singleton::{
    AcquireOutcome, BlobLeaseLock, InMemoryLockCollaborator, LockCollaborator, LockState,
    LockToken, SingletonLock,
};
pub use tokio_util::sync::CancellationToken;
