//! Message types and the identifiers the lease bookkeeping is keyed on.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Suffix SQS requires on FIFO queue names
    pub const FIFO_SUFFIX: &'static str = ".fifo";

    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 80 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-80 characters".to_string(),
            });
        }

        let base = name.strip_suffix(Self::FIFO_SUFFIX).unwrap_or(&name);
        if base.is_empty()
            || !base
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores and a '.fifo' suffix allowed"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if the name designates a FIFO queue
    pub fn is_fifo(&self) -> bool {
        self.0.ends_with(Self::FIFO_SUFFIX)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(name: QueueName) -> Self {
        name.0
    }
}

/// Provider-assigned identifier of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque token returned by a receive; required to delete, extend or requeue.
///
/// The token is only valid for the delivery that produced it. Once the
/// message becomes visible again, or is deleted, the provider may reject it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    /// Wrap a provider receipt token
    pub fn new(handle: String) -> Result<Self, ValidationError> {
        if handle.is_empty() {
            return Err(ValidationError::Required {
                field: "receipt_handle".to_string(),
            });
        }
        Ok(Self(handle))
    }

    /// Get the raw receipt token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    // Receipts are long; the prefix is enough to correlate log lines.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.chars().count() > 16 {
            let prefix: String = self.0.chars().take(16).collect();
            write!(f, "{}...", prefix)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Timestamp `duration` from now
    pub fn after(duration: Duration) -> Self {
        Self::now().plus(duration)
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Add a std duration, saturating at the original value on overflow
    pub fn plus(&self, duration: Duration) -> Self {
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        Self(self.0.checked_add_signed(delta).unwrap_or(self.0))
    }

    /// Time left until this timestamp, zero if it already passed
    pub fn remaining(&self) -> Duration {
        (self.0 - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Check if this timestamp is in the past
    pub fn has_passed(&self) -> bool {
        Utc::now() >= self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message received from the queue together with its current lease.
///
/// `next_visible_on` is computed locally when the message is received or its
/// lease renewed; the queue itself does not report it.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub next_visible_on: Timestamp,
    pub body: Bytes,
    pub attributes: HashMap<String, String>,
}

impl Message {
    /// Attribute SQS uses to report how often a message was received
    pub const RECEIVE_COUNT_ATTRIBUTE: &'static str = "ApproximateReceiveCount";

    /// Create a message with an already computed lease deadline
    pub fn new(
        message_id: MessageId,
        receipt_handle: ReceiptHandle,
        next_visible_on: Timestamp,
        body: Bytes,
        attributes: HashMap<String, String>,
    ) -> Self {
        Self {
            message_id,
            receipt_handle,
            next_visible_on,
            body,
            attributes,
        }
    }

    /// Body as UTF-8, if it is valid UTF-8
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// How many times the provider has delivered this message, when reported
    pub fn dequeue_count(&self) -> Option<u32> {
        self.attributes
            .get(Self::RECEIVE_COUNT_ATTRIBUTE)
            .and_then(|value| value.parse().ok())
    }

    /// Copy of the message with a new lease deadline
    pub fn with_next_visible_on(mut self, next_visible_on: Timestamp) -> Self {
        self.next_visible_on = next_visible_on;
        self
    }

    /// Check whether the lease on this delivery has run out
    pub fn lease_expired(&self) -> bool {
        self.next_visible_on.has_passed()
    }
}

/// A raw message as returned by a provider, before lease bookkeeping
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub body: Bytes,
    pub attributes: HashMap<String, String>,
}

impl ReceivedMessage {
    /// Attach the lease deadline computed by the lease manager
    pub fn into_message(self, next_visible_on: Timestamp) -> Message {
        Message::new(
            self.message_id,
            self.receipt_handle,
            next_visible_on,
            self.body,
            self.attributes,
        )
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
