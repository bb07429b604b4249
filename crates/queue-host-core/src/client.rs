//! Queue client adapter: the five primitive queue operations the host needs.

use crate::error::QueueError;
use crate::message::{QueueName, ReceiptHandle, ReceivedMessage};
use crate::provider::{AwsSqsConfig, ProviderConfig, ProviderType};
use crate::providers::{AwsSqsProvider, AzureQueueProvider, InMemoryProvider};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Result of a delete that did not fail.
///
/// A message or queue that no longer exists cannot be deleted twice, so
/// callers treat `NotFound` as success. It is still reported separately so
/// it can be logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Interface implemented by queue providers (AWS SQS, Azure Queue Storage, in-memory)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `max_count` messages, hiding each for `visibility_timeout`.
    ///
    /// An empty vector means the queue had nothing available.
    async fn receive_batch(
        &self,
        queue: &QueueName,
        max_count: u32,
        visibility_timeout: Duration,
        attribute_names: &[String],
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Delete a message. A vanished queue or message yields `NotFound`.
    async fn delete(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<DeleteOutcome, QueueError>;

    /// Set the remaining invisibility of one message. Zero requeues it.
    ///
    /// Returns the receipt that is valid from now on. Providers that issue a
    /// new receipt on every update (Azure pop receipts) return the new one;
    /// the old one is stale after this call.
    async fn change_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError>;

    /// Set the remaining invisibility of several messages at once.
    ///
    /// Returns the current receipts in the order of `receipts`.
    async fn change_visibility_batch(
        &self,
        queue: &QueueName,
        receipts: &[ReceiptHandle],
        timeout: Duration,
    ) -> Result<Vec<ReceiptHandle>, QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Factory for creating queue clients from configuration
pub struct QueueClientFactory;

impl QueueClientFactory {
    /// Create queue client from configuration
    pub fn create_client(config: &ProviderConfig) -> Result<Arc<dyn QueueClient>, QueueError> {
        let client: Arc<dyn QueueClient> = match config {
            ProviderConfig::InMemory => Arc::new(InMemoryProvider::new()),
            ProviderConfig::AwsSqs(aws_config) => {
                let aws_config: AwsSqsConfig = aws_config.clone().with_env_credentials();
                Arc::new(AwsSqsProvider::new(aws_config).map_err(|e| e.to_queue_error())?)
            }
            ProviderConfig::AzureQueue(azure_config) => {
                Arc::new(AzureQueueProvider::new(azure_config.clone().with_env_url())?)
            }
        };
        Ok(client)
    }
}
