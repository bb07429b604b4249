//! Error types for queue, lock and host operations.

use std::time::Duration;
use thiserror::Error;

/// Error type for all queue client operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message not found or receipt expired: {receipt}")]
    MessageNotFound { receipt: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Batch size {size} exceeds maximum {max_size}")]
    BatchTooLarge { size: usize, max_size: usize },

    #[error("Batch operation {operation} failed for entries: {failed:?}")]
    BatchEntriesFailed {
        operation: String,
        failed: Vec<String>,
    },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Malformed provider response: {message}")]
    MalformedResponse { message: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::BatchTooLarge { .. } => false,
            Self::BatchEntriesFailed { .. } => true,
            Self::ProviderError { .. } => true, // Throttling and 5xx end up here
            Self::MalformedResponse { .. } => true,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Check if the error means the queue or message no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::QueueNotFound { .. } | Self::MessageNotFound { .. }
        )
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

/// Configuration errors, always raised before the host starts polling
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Validation errors for domain identifiers
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Errors raised by the singleton lock and its collaborators.
///
/// A lock held by another instance is not an error; see
/// [`crate::singleton::AcquireOutcome::Busy`].
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Singleton lock '{resource_key}' was lost")]
    Lost { resource_key: String },

    #[error("Singleton lock '{resource_key}' was lost earlier in this run; reacquisition is not allowed")]
    LostInRun { resource_key: String },

    #[error("Lock collaborator unavailable: {message}")]
    Transport { message: String },

    #[error("Invalid lock request: {message}")]
    Invalid { message: String },
}

impl LockError {
    /// Check if the collaborator call may succeed when retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Errors that end a host run.
///
/// Per-message handler failures never surface here; they are logged and the
/// message is requeued.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Configuration invalid: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Singleton lock lost: {0}")]
    LockLost(#[source] LockError),

    #[error("Lock collaborator failed: {0}")]
    Lock(#[source] LockError),

    #[error("Queue transport failed after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: QueueError,
    },

    #[error("Queue operation failed: {0}")]
    Queue(#[source] QueueError),
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
