//! Azure Queue Storage provider over the Queue REST API.
//!
//! Requests authenticate with the SAS token carried in the queue service URL;
//! no account key is ever held by the host.
//!
//! Every update of a message issues a new pop receipt and invalidates the old
//! one. The receipt handle handed to the host therefore packs the message id
//! together with the current pop receipt, and [`QueueClient::change_visibility`]
//! returns the repacked handle.
//!
//! Status mapping:
//! - receive: `200` messages, `404` queue not found
//! - delete: `204` deleted, `404` or a pop receipt mismatch is not found
//! - update: `204` with `x-ms-popreceipt`, `404` or a mismatch is message not found
//!
//! Message text is passed through unchanged; producers that base64-encode
//! their payloads must decode in the handler.

use crate::client::{DeleteOutcome, QueueClient};
use crate::error::{QueueError, ValidationError};
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage};
use crate::provider::{AzureQueueConfig, ProviderType};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client as HttpClient, Response, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[cfg(test)]
#[path = "azure_tests.rs"]
mod tests;

const STORAGE_API_VERSION: &str = "2021-08-06";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POP_RECEIPT_ERROR: &str = "PopReceiptMismatch";

/// Separates message id and pop receipt inside a receipt handle. Neither
/// GUID message ids nor base64 pop receipts contain it.
const RECEIPT_SEPARATOR: char = '|';

/// Attributes copied from each `QueueMessage` besides the dequeue count
const TIMESTAMP_ATTRIBUTES: [&str; 3] = ["InsertionTime", "ExpirationTime", "TimeNextVisible"];

// ============================================================================
// Receipt Handles
// ============================================================================

fn pack_receipt(message_id: &str, pop_receipt: &str) -> Result<ReceiptHandle, QueueError> {
    if message_id.is_empty() || pop_receipt.is_empty() {
        return Err(QueueError::MalformedResponse {
            message: "message without MessageId or PopReceipt".to_string(),
        });
    }
    Ok(ReceiptHandle::new(format!(
        "{}{}{}",
        message_id, RECEIPT_SEPARATOR, pop_receipt
    ))?)
}

/// Split a handle into `(message_id, pop_receipt)`
fn unpack_receipt(receipt: &ReceiptHandle) -> Result<(&str, &str), QueueError> {
    receipt
        .as_str()
        .split_once(RECEIPT_SEPARATOR)
        .filter(|(id, pop)| !id.is_empty() && !pop.is_empty())
        .ok_or_else(|| QueueError::MessageNotFound {
            receipt: receipt.to_string(),
        })
}

// ============================================================================
// XML Parsing
// ============================================================================

mod xml {
    use crate::error::QueueError;
    use quick_xml::events::Event;
    use quick_xml::Reader;
    use std::collections::HashMap;

    /// One `QueueMessage` element, fields as text
    #[derive(Debug, Default)]
    pub(super) struct RawQueueMessage {
        pub message_id: String,
        pub pop_receipt: String,
        pub dequeue_count: Option<String>,
        pub message_text: String,
        pub other: HashMap<String, String>,
    }

    fn parse_error(e: impl std::fmt::Display) -> QueueError {
        QueueError::MalformedResponse {
            message: format!("XML parsing error: {}", e),
        }
    }

    /// Parse a `QueueMessagesList` document
    pub(super) fn parse_messages_list(xml: &str) -> Result<Vec<RawQueueMessage>, QueueError> {
        let mut reader = Reader::from_str(xml);
        // MessageText keeps its whitespace.
        reader.trim_text(false);

        let mut messages = Vec::new();
        let mut current: Option<RawQueueMessage> = None;
        let mut element: Option<String> = None;
        let mut text = String::new();
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if name == "QueueMessage" {
                        current = Some(RawQueueMessage::default());
                        element = None;
                    } else if current.is_some() {
                        element = Some(name);
                    }
                    text.clear();
                }
                Ok(Event::Text(e)) if element.is_some() => {
                    text.push_str(&e.unescape().map_err(parse_error)?);
                }
                Ok(Event::CData(e)) if element.is_some() => {
                    text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
                Ok(Event::End(ref e)) => {
                    let name = e.name();
                    if name.as_ref() == b"QueueMessage" {
                        if let Some(message) = current.take() {
                            messages.push(message);
                        }
                    } else if let (Some(message), Some(field)) = (current.as_mut(), element.take())
                    {
                        let value = std::mem::take(&mut text);
                        match field.as_str() {
                            "MessageId" => message.message_id = value.trim().to_string(),
                            "PopReceipt" => message.pop_receipt = value.trim().to_string(),
                            "DequeueCount" => {
                                message.dequeue_count = Some(value.trim().to_string())
                            }
                            "MessageText" => message.message_text = value,
                            _ => {
                                message.other.insert(field, value.trim().to_string());
                            }
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(parse_error(e)),
                _ => {}
            }
            buf.clear();
        }

        Ok(messages)
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Azure Queue Storage client authenticated by a SAS URL
pub struct AzureQueueProvider {
    http_client: HttpClient,
    service_url: Url,
}

impl AzureQueueProvider {
    /// Create a provider for the queue service at `config.queue_service_url`.
    ///
    /// The SAS token needs the process, update and read permissions.
    pub fn new(config: AzureQueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let service_url =
            Url::parse(&config.queue_service_url).map_err(|e| QueueError::ConnectionFailed {
                message: format!("invalid queue service URL: {}", e),
            })?;

        let http_client = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            service_url,
        })
    }

    /// `{service}/{queue}/messages[/{message_id}]`, keeping the SAS query
    fn messages_url(&self, queue: &QueueName, message_id: Option<&str>) -> Result<Url, QueueError> {
        check_queue_name(queue)?;
        let mut url = self.service_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| QueueError::ConnectionFailed {
                message: "queue service URL cannot carry a queue path".to_string(),
            })?;
            segments.pop_if_empty().push(queue.as_str()).push("messages");
            if let Some(id) = message_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn update_message(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError> {
        let (message_id, pop_receipt) = unpack_receipt(receipt)?;
        let mut url = self.messages_url(queue, Some(message_id))?;
        url.query_pairs_mut()
            .append_pair("popreceipt", pop_receipt)
            .append_pair("visibilitytimeout", &timeout.as_secs().to_string());

        let response = self
            .http_client
            .put(url)
            .header("x-ms-version", STORAGE_API_VERSION)
            .body(Vec::<u8>::new())
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => {
                let new_pop_receipt = response
                    .headers()
                    .get("x-ms-popreceipt")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| QueueError::MalformedResponse {
                        message: "update response without x-ms-popreceipt".to_string(),
                    })?;
                pack_receipt(message_id, new_pop_receipt)
            }
            StatusCode::NOT_FOUND => Err(QueueError::MessageNotFound {
                receipt: receipt.to_string(),
            }),
            _ if error_code(&response).as_deref() == Some(POP_RECEIPT_ERROR) => {
                Err(QueueError::MessageNotFound {
                    receipt: receipt.to_string(),
                })
            }
            _ => Err(status_error("update message", &response)),
        }
    }

    fn build_received_message(raw: xml::RawQueueMessage) -> Result<ReceivedMessage, QueueError> {
        let receipt_handle = pack_receipt(&raw.message_id, &raw.pop_receipt)?;
        let message_id = MessageId::from_str(&raw.message_id)?;

        let mut attributes: HashMap<String, String> = raw
            .other
            .into_iter()
            .filter(|(name, _)| TIMESTAMP_ATTRIBUTES.contains(&name.as_str()))
            .collect();
        if let Some(count) = raw.dequeue_count {
            attributes.insert(Message::RECEIVE_COUNT_ATTRIBUTE.to_string(), count);
        }

        Ok(ReceivedMessage {
            message_id,
            receipt_handle,
            body: bytes::Bytes::from(raw.message_text),
            attributes,
        })
    }
}

impl fmt::Debug for AzureQueueProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The query string holds the SAS signature.
        let mut redacted = self.service_url.clone();
        redacted.set_query(None);
        f.debug_struct("AzureQueueProvider")
            .field("service_url", &redacted.as_str())
            .finish()
    }
}

/// Azure queue names are 3-63 lowercase letters, digits and hyphens
fn check_queue_name(queue: &QueueName) -> Result<(), QueueError> {
    let name = queue.as_str();
    let valid = (3..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--");
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidFormat {
            field: "queue_name".to_string(),
            message: format!("'{}' is not a valid Azure queue name", name),
        }
        .into())
    }
}

fn transport_error(e: reqwest::Error) -> QueueError {
    if e.is_timeout() {
        QueueError::Timeout {
            duration: REQUEST_TIMEOUT,
        }
    } else {
        QueueError::ConnectionFailed {
            message: e.to_string(),
        }
    }
}

fn error_code(response: &Response) -> Option<String> {
    response
        .headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn status_error(operation: &str, response: &Response) -> QueueError {
    let status = response.status();
    let code = error_code(&response).unwrap_or_else(|| status.as_u16().to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => QueueError::AuthenticationFailed {
            message: format!("{} rejected: {}", operation, code),
        },
        _ => QueueError::ProviderError {
            provider: ProviderType::AzureQueue.to_string(),
            code,
            message: format!("{} failed with HTTP {}", operation, status),
        },
    }
}

#[async_trait]
impl QueueClient for AzureQueueProvider {
    async fn receive_batch(
        &self,
        queue: &QueueName,
        max_count: u32,
        visibility_timeout: Duration,
        _attribute_names: &[String],
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let max_size = ProviderType::AzureQueue.max_batch_size();
        if max_count > max_size {
            return Err(QueueError::BatchTooLarge {
                size: max_count as usize,
                max_size: max_size as usize,
            });
        }

        let mut url = self.messages_url(queue, None)?;
        url.query_pairs_mut()
            .append_pair("numofmessages", &max_count.max(1).to_string())
            // The service rejects a zero visibility timeout on receive.
            .append_pair(
                "visibilitytimeout",
                &visibility_timeout.as_secs().max(1).to_string(),
            );

        let response = self
            .http_client
            .get(url)
            .header("x-ms-version", STORAGE_API_VERSION)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(QueueError::QueueNotFound {
                    queue_name: queue.to_string(),
                })
            }
            _ => return Err(status_error("get messages", &response)),
        }

        let body = response.text().await.map_err(transport_error)?;
        xml::parse_messages_list(&body)?
            .into_iter()
            .map(Self::build_received_message)
            .collect()
    }

    async fn delete(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<DeleteOutcome, QueueError> {
        let (message_id, pop_receipt) = unpack_receipt(receipt)?;
        let mut url = self.messages_url(queue, Some(message_id))?;
        url.query_pairs_mut().append_pair("popreceipt", pop_receipt);

        let response = self
            .http_client
            .delete(url)
            .header("x-ms-version", STORAGE_API_VERSION)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(DeleteOutcome::Deleted),
            StatusCode::NOT_FOUND => {
                debug!(queue = %queue, receipt = %receipt, "Message already gone");
                Ok(DeleteOutcome::NotFound)
            }
            _ if error_code(&response).as_deref() == Some(POP_RECEIPT_ERROR) => {
                debug!(queue = %queue, receipt = %receipt, "Pop receipt superseded");
                Ok(DeleteOutcome::NotFound)
            }
            _ => Err(status_error("delete message", &response)),
        }
    }

    async fn change_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError> {
        self.update_message(queue, receipt, timeout).await
    }

    /// The Queue API has no batch update; entries are updated concurrently.
    ///
    /// On `BatchEntriesFailed` the entries that did succeed have already been
    /// issued new receipts, which are not returned.
    async fn change_visibility_batch(
        &self,
        queue: &QueueName,
        receipts: &[ReceiptHandle],
        timeout: Duration,
    ) -> Result<Vec<ReceiptHandle>, QueueError> {
        let results = join_all(
            receipts
                .iter()
                .map(|receipt| self.update_message(queue, receipt, timeout)),
        )
        .await;

        let mut renewed = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(receipt) => renewed.push(receipt),
                Err(e) => {
                    warn!(
                        queue = %queue,
                        entry = index,
                        error = %e,
                        "Visibility change rejected for batch entry"
                    );
                    failed.push(format!("m{}", index));
                }
            }
        }

        if failed.is_empty() {
            Ok(renewed)
        } else {
            Err(QueueError::BatchEntriesFailed {
                operation: "UpdateMessage".to_string(),
                failed,
            })
        }
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AzureQueue
    }
}
