//! Message lease management.
//!
//! A lease is the window in which a received message stays invisible to
//! other consumers. The queue does not report it, so the [`LeaseManager`]
//! computes `next_visible_on` itself whenever it receives or renews a
//! message.
//!
//! Error policy:
//! - receive and renew failures propagate; the caller decides on backoff
//! - delete failures are suppressed only when the message or queue is gone
//! - release failures propagate so the caller can log them

use crate::client::{DeleteOutcome, QueueClient};
use crate::config::HostOptions;
use crate::error::QueueError;
use crate::message::{Message, QueueName, ReceiptHandle, Timestamp};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;

/// Receives, renews, acknowledges and releases messages of one queue
#[derive(Clone)]
pub struct LeaseManager {
    client: Arc<dyn QueueClient>,
    queue: QueueName,
    visibility_timeout: Duration,
    attribute_names: Vec<String>,
}

impl LeaseManager {
    /// Create a lease manager for the queue described by `options`
    pub fn new(client: Arc<dyn QueueClient>, options: &HostOptions) -> Self {
        Self {
            client,
            queue: options.queue.clone(),
            visibility_timeout: options.visibility_timeout(),
            attribute_names: options.attribute_names.clone(),
        }
    }

    /// Queue this manager works on
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Lease length applied on receive and renew
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Receive up to `max_batch_size` messages and start a lease on each.
    ///
    /// An empty vector is the normal "no work" outcome.
    #[instrument(skip(self), fields(queue = %self.queue))]
    pub async fn retrieve(&self, max_batch_size: u32) -> Result<Vec<Message>, QueueError> {
        // Taken before the call so the local deadline never outlives the real one.
        let next_visible_on = Timestamp::after(self.visibility_timeout);

        let received = self
            .client
            .receive_batch(
                &self.queue,
                max_batch_size,
                self.visibility_timeout,
                &self.attribute_names,
            )
            .await?;

        debug!(count = received.len(), "Received batch");
        Ok(received
            .into_iter()
            .map(|message| message.into_message(next_visible_on))
            .collect())
    }

    /// Delete a processed message.
    ///
    /// A message or queue that is already gone counts as deleted.
    pub async fn acknowledge(&self, message: &Message) -> Result<DeleteOutcome, QueueError> {
        match self.client.delete(&self.queue, &message.receipt_handle).await {
            Ok(DeleteOutcome::Deleted) => Ok(DeleteOutcome::Deleted),
            Ok(DeleteOutcome::NotFound) => {
                debug!(
                    queue = %self.queue,
                    message_id = %message.message_id,
                    "Message already deleted"
                );
                Ok(DeleteOutcome::NotFound)
            }
            Err(e) if e.is_not_found() => {
                debug!(
                    queue = %self.queue,
                    message_id = %message.message_id,
                    error = %e,
                    "Message or queue gone before delete"
                );
                Ok(DeleteOutcome::NotFound)
            }
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    message_id = %message.message_id,
                    operation = "delete",
                    error = %e,
                    "Failed to acknowledge message"
                );
                Err(e)
            }
        }
    }

    /// Delete several processed messages.
    ///
    /// Every delete is attempted; the first unsuppressed error is returned.
    pub async fn acknowledge_batch(&self, messages: &[Message]) -> Result<(), QueueError> {
        let results = join_all(messages.iter().map(|m| self.acknowledge(m))).await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// Extend a message's lease by the visibility timeout, counted from now.
    ///
    /// `message` is updated in place with the new deadline and with the
    /// receipt the provider returned, which replaces the old one. Returns the
    /// new deadline.
    pub async fn renew(&self, message: &mut Message) -> Result<Timestamp, QueueError> {
        let next_visible_on = Timestamp::after(self.visibility_timeout);
        let receipt = self
            .client
            .change_visibility(&self.queue, &message.receipt_handle, self.visibility_timeout)
            .await
            .inspect_err(|e| {
                warn!(
                    queue = %self.queue,
                    message_id = %message.message_id,
                    operation = "renew",
                    error = %e,
                    "Failed to renew message lease"
                );
            })?;

        message.receipt_handle = receipt;
        message.next_visible_on = next_visible_on;
        debug!(
            queue = %self.queue,
            message_id = %message.message_id,
            next_visible_on = %next_visible_on,
            "Renewed message lease"
        );
        Ok(next_visible_on)
    }

    /// Extend the leases of a batch to one shared deadline, updating each
    /// message's receipt and deadline in place
    pub async fn renew_batch(&self, messages: &mut [Message]) -> Result<Timestamp, QueueError> {
        let next_visible_on = Timestamp::after(self.visibility_timeout);
        if messages.is_empty() {
            return Ok(next_visible_on);
        }

        let renewed = self
            .client
            .change_visibility_batch(&self.queue, &receipts(messages), self.visibility_timeout)
            .await
            .inspect_err(|e| {
                warn!(
                    queue = %self.queue,
                    count = messages.len(),
                    operation = "renew_batch",
                    error = %e,
                    "Failed to renew batch leases"
                );
            })?;
        if renewed.len() != messages.len() {
            return Err(QueueError::MalformedResponse {
                message: format!(
                    "renewed {} receipts for {} messages",
                    renewed.len(),
                    messages.len()
                ),
            });
        }

        for (message, receipt) in messages.iter_mut().zip(renewed) {
            message.receipt_handle = receipt;
            message.next_visible_on = next_visible_on;
        }
        Ok(next_visible_on)
    }

    /// Make a message visible again immediately so it is redelivered
    pub async fn release(&self, message: &Message) -> Result<(), QueueError> {
        self.client
            .change_visibility(&self.queue, &message.receipt_handle, Duration::ZERO)
            .await
            .map(|_| ())
            .inspect_err(|e| {
                warn!(
                    queue = %self.queue,
                    message_id = %message.message_id,
                    operation = "release",
                    error = %e,
                    "Failed to release message; it becomes visible when its lease expires"
                );
            })
    }

    /// Make several messages visible again immediately
    pub async fn release_batch(&self, messages: &[Message]) -> Result<(), QueueError> {
        if messages.is_empty() {
            return Ok(());
        }

        self.client
            .change_visibility_batch(&self.queue, &receipts(messages), Duration::ZERO)
            .await
            .map(|_| ())
            .inspect_err(|e| {
                warn!(
                    queue = %self.queue,
                    count = messages.len(),
                    operation = "release_batch",
                    error = %e,
                    "Failed to release batch"
                );
            })
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("queue", &self.queue)
            .field("provider", &self.client.provider_type())
            .field("visibility_timeout", &self.visibility_timeout)
            .finish()
    }
}

fn receipts(messages: &[Message]) -> Vec<ReceiptHandle> {
    messages.iter().map(|m| m.receipt_handle.clone()).collect()
}
