//! In-memory queue provider implementation for testing and development.
//!
//! This provider implements the same visibility semantics as a cloud queue:
//! - Received messages stay invisible for the requested visibility timeout
//! - Every receive issues a fresh receipt; older receipts stop working
//! - Setting visibility to zero makes a message receivable again immediately
//! - Deleting from a vanished queue reports `NotFound`
//!
//! Visibility is tracked with `tokio::time::Instant`, so tests running with a
//! paused clock control expiry deterministically.

use crate::client::{DeleteOutcome, QueueClient};
use crate::error::QueueError;
use crate::message::{MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp};
use crate::provider::ProviderType;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
    pending_receive_failures: u32,
}

#[derive(Default)]
struct InMemoryQueue {
    /// Messages in enqueue order
    messages: Vec<StoredMessage>,
}

struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    attributes: HashMap<String, String>,
    enqueued_at: Timestamp,
    receive_count: u32,
    visible_at: Instant,
    /// Receipt of the latest delivery
    receipt: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_at
    }

    fn holds_receipt(&self, receipt: &ReceiptHandle) -> bool {
        self.receipt.as_deref() == Some(receipt.as_str())
    }
}

// ============================================================================
// InMemoryProvider
// ============================================================================

/// In-memory queue provider
#[derive(Clone, Default)]
pub struct InMemoryProvider {
    storage: Arc<RwLock<QueueStorage>>,
}

impl InMemoryProvider {
    /// Largest batch a single receive may request
    pub const MAX_BATCH_SIZE: u32 = 32;

    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, QueueStorage> {
        // A poisoned lock only means a test panicked mid-update; the data is still usable.
        self.storage.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueueStorage> {
        self.storage.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a queue if it does not exist yet
    pub fn create_queue(&self, queue: &QueueName) {
        self.write().queues.entry(queue.clone()).or_default();
    }

    /// Delete a queue and every message in it
    pub fn delete_queue(&self, queue: &QueueName) -> bool {
        self.write().queues.remove(queue).is_some()
    }

    /// Enqueue a message, creating the queue on first use
    pub fn send_message(&self, queue: &QueueName, body: impl Into<Bytes>) -> MessageId {
        self.send_message_with_attributes(queue, body, HashMap::new())
    }

    /// Enqueue a message with provider attributes
    pub fn send_message_with_attributes(
        &self,
        queue: &QueueName,
        body: impl Into<Bytes>,
        attributes: HashMap<String, String>,
    ) -> MessageId {
        let message_id = MessageId::new();
        let stored = StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            attributes,
            enqueued_at: Timestamp::now(),
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        };
        self.write()
            .queues
            .entry(queue.clone())
            .or_default()
            .messages
            .push(stored);
        message_id
    }

    /// Make the next `count` receives fail with a connection error
    pub fn inject_receive_failures(&self, count: u32) {
        self.write().pending_receive_failures = count;
    }

    /// Total messages stored in the queue, visible or not
    pub fn message_count(&self, queue: &QueueName) -> usize {
        self.read()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Messages that a receive would return right now
    pub fn visible_count(&self, queue: &QueueName) -> usize {
        let now = Instant::now();
        self.read()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().filter(|m| m.is_visible(now)).count())
            .unwrap_or(0)
    }

    /// Messages currently leased by a consumer
    pub fn in_flight_count(&self, queue: &QueueName) -> usize {
        let now = Instant::now();
        self.read()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().filter(|m| !m.is_visible(now)).count())
            .unwrap_or(0)
    }

    /// How often a message has been received, if it still exists
    pub fn receive_count(&self, queue: &QueueName, message_id: &MessageId) -> Option<u32> {
        self.read().queues.get(queue).and_then(|q| {
            q.messages
                .iter()
                .find(|m| &m.message_id == message_id)
                .map(|m| m.receive_count)
        })
    }

    /// Check whether a message is still stored in the queue
    pub fn contains(&self, queue: &QueueName, message_id: &MessageId) -> bool {
        self.receive_count(queue, message_id).is_some()
    }

    /// Time until a stored message becomes visible, zero if it already is
    pub fn invisible_for(&self, queue: &QueueName, message_id: &MessageId) -> Option<Duration> {
        let now = Instant::now();
        self.read().queues.get(queue).and_then(|q| {
            q.messages
                .iter()
                .find(|m| &m.message_id == message_id)
                .map(|m| m.visible_at.saturating_duration_since(now))
        })
    }
}

impl std::fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProvider")
            .field("queues", &self.read().queues.len())
            .finish()
    }
}

fn attribute_requested(attribute_names: &[String], name: &str) -> bool {
    attribute_names.iter().any(|n| n == "All" || n == name)
}

#[async_trait]
impl QueueClient for InMemoryProvider {
    async fn receive_batch(
        &self,
        queue: &QueueName,
        max_count: u32,
        visibility_timeout: Duration,
        attribute_names: &[String],
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        if max_count > Self::MAX_BATCH_SIZE {
            return Err(QueueError::BatchTooLarge {
                size: max_count as usize,
                max_size: Self::MAX_BATCH_SIZE as usize,
            });
        }

        let mut storage = self.write();
        if storage.pending_receive_failures > 0 {
            storage.pending_receive_failures -= 1;
            return Err(QueueError::ConnectionFailed {
                message: "injected receive failure".to_string(),
            });
        }

        let stored_queue =
            storage
                .queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::QueueNotFound {
                    queue_name: queue.to_string(),
                })?;

        let now = Instant::now();
        let mut received = Vec::new();
        for stored in stored_queue
            .messages
            .iter_mut()
            .filter(|m| m.is_visible(now))
            .take(max_count as usize)
        {
            let receipt = uuid::Uuid::new_v4().to_string();
            stored.receive_count += 1;
            stored.visible_at = now + visibility_timeout;
            stored.receipt = Some(receipt.clone());

            let mut attributes = stored.attributes.clone();
            if attribute_requested(attribute_names, "ApproximateReceiveCount") {
                attributes.insert(
                    "ApproximateReceiveCount".to_string(),
                    stored.receive_count.to_string(),
                );
            }
            if attribute_requested(attribute_names, "SentTimestamp") {
                attributes.insert(
                    "SentTimestamp".to_string(),
                    stored
                        .enqueued_at
                        .as_datetime()
                        .timestamp_millis()
                        .to_string(),
                );
            }

            received.push(ReceivedMessage {
                message_id: stored.message_id.clone(),
                receipt_handle: ReceiptHandle::new(receipt)?,
                body: stored.body.clone(),
                attributes,
            });
        }

        Ok(received)
    }

    async fn delete(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<DeleteOutcome, QueueError> {
        let mut storage = self.write();
        let Some(stored_queue) = storage.queues.get_mut(queue) else {
            return Ok(DeleteOutcome::NotFound);
        };

        match stored_queue
            .messages
            .iter()
            .position(|m| m.holds_receipt(receipt))
        {
            Some(index) => {
                stored_queue.messages.remove(index);
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn change_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError> {
        self.change_visibility_batch(queue, std::slice::from_ref(receipt), timeout)
            .await
            .map(|_| receipt.clone())
            .map_err(|e| match e {
                QueueError::BatchEntriesFailed { .. } => QueueError::MessageNotFound {
                    receipt: receipt.to_string(),
                },
                other => other,
            })
    }

    async fn change_visibility_batch(
        &self,
        queue: &QueueName,
        receipts: &[ReceiptHandle],
        timeout: Duration,
    ) -> Result<Vec<ReceiptHandle>, QueueError> {
        let mut storage = self.write();
        let stored_queue =
            storage
                .queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::QueueNotFound {
                    queue_name: queue.to_string(),
                })?;

        let now = Instant::now();
        let mut failed = Vec::new();
        for (index, receipt) in receipts.iter().enumerate() {
            // Only a message still in flight under this receipt can be changed.
            match stored_queue
                .messages
                .iter_mut()
                .find(|m| m.holds_receipt(receipt) && !m.is_visible(now))
            {
                Some(stored) => stored.visible_at = now + timeout,
                None => failed.push(format!("m{}", index)),
            }
        }

        // Receipts stay valid across visibility changes here.
        if failed.is_empty() {
            Ok(receipts.to_vec())
        } else {
            Err(QueueError::BatchEntriesFailed {
                operation: "ChangeMessageVisibilityBatch".to_string(),
                failed,
            })
        }
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}
