//! AWS SQS provider implementation using the HTTP Query API.
//!
//! The provider talks to SQS with plain HTTP requests instead of the AWS SDK,
//! which keeps the dependency footprint small and lets unit tests run against
//! a mocked endpoint.
//!
//! ## Key Features
//!
//! - **AWS Signature V4**: requests are signed by hand (`hmac`, `sha2`)
//! - **Session credentials**: an optional session token is sent and signed
//! - **Queue URL caching**: `GetQueueUrl` is called once per queue
//! - **Endpoint override**: for LocalStack and tests
//! - **Batch visibility changes**: entries correlate by position, never by
//!   message id, so a redelivered message cannot be extended by a stale entry
//!
//! Message bodies are passed through unchanged; the host does not impose an
//! encoding on producers.

use crate::client::{DeleteOutcome, QueueClient};
use crate::error::{ConfigurationError, QueueError};
use crate::message::{MessageId, QueueName, ReceiptHandle, ReceivedMessage};
use crate::provider::{AwsSqsConfig, ProviderType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

const API_VERSION: &str = "2012-11-05";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BATCH_ENTRIES: usize = 10;

// ============================================================================
// Error Types
// ============================================================================

/// AWS SQS specific errors
#[derive(Debug, thiserror::Error)]
pub enum AwsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("SQS service error: {code}: {message}")]
    ServiceError {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AwsError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::Timeout(_) => true,
            Self::ServiceError { status, .. } => *status >= 500 || *status == 400,
            Self::QueueNotFound(_) => false,
            Self::InvalidReceipt(_) => false,
            Self::ConfigurationError(_) => false,
            Self::SerializationError(_) => true,
        }
    }

    /// Map AWS error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(msg) => QueueError::AuthenticationFailed { message: msg },
            Self::NetworkError(msg) => QueueError::ConnectionFailed { message: msg },
            Self::Timeout(_) => QueueError::Timeout {
                duration: REQUEST_TIMEOUT,
            },
            Self::ServiceError { code, message, .. } => QueueError::ProviderError {
                provider: ProviderType::AwsSqs.to_string(),
                code,
                message,
            },
            Self::QueueNotFound(queue) => QueueError::QueueNotFound { queue_name: queue },
            Self::InvalidReceipt(receipt) => QueueError::MessageNotFound { receipt },
            Self::ConfigurationError(msg) => {
                QueueError::ConfigurationError(ConfigurationError::Invalid { message: msg })
            }
            Self::SerializationError(msg) => QueueError::MalformedResponse { message: msg },
        }
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for request authentication
///
/// Implements the AWS Signature V4 signing process:
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
///
/// ## References
///
/// - [AWS Signature V4](https://docs.aws.amazon.com/general/latest/gr/signature-version-4.html)
#[derive(Clone)]
struct AwsV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
    service: String,
}

impl AwsV4Signer {
    fn new(
        access_key: String,
        secret_key: String,
        session_token: Option<String>,
        region: String,
    ) -> Self {
        Self {
            access_key,
            secret_key,
            session_token,
            region,
            service: "sqs".to_string(),
        }
    }

    /// Sign an HTTP request with AWS Signature V4
    ///
    /// Returns the headers to add to the request: `Authorization`,
    /// `x-amz-date`, `host` and, for session credentials,
    /// `x-amz-security-token`.
    ///
    /// `canonical_query` must already be URI-encoded and sorted by key.
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        canonical_query: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Result<Vec<(String, String)>, AwsError> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        // Canonical headers (must be sorted)
        let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let mut signed_headers = "host;x-amz-date".to_string();
        if let Some(token) = &self.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp)?;

        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.access_key, credential_scope, signed_headers, signature
        );

        let mut headers = vec![
            ("Authorization".to_string(), authorization_header),
            ("x-amz-date".to_string(), amz_date),
            ("host".to_string(), host.to_string()),
        ];
        if let Some(token) = &self.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        Ok(headers)
    }

    /// Calculate AWS Signature V4 signature
    ///
    /// Derives the signing key with the HMAC-SHA256 chain
    /// `"AWS4" + secret -> date -> region -> service -> "aws4_request"`
    /// and signs `string_to_sign` with it.
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> Result<String, AwsError> {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = Self::hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes())?;
        let k_region = Self::hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = Self::hmac_sha256(&k_region, self.service.as_bytes())?;
        let k_signing = Self::hmac_sha256(&k_service, b"aws4_request")?;
        let signature = Self::hmac_sha256(&k_signing, string_to_sign.as_bytes())?;

        Ok(hex::encode(signature))
    }

    fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AwsError> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| AwsError::Authentication(format!("Invalid signing key: {}", e)))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Build the sorted, URI-encoded query string used both on the wire and in
/// the canonical request.
fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut encoded = params
        .iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(k).into_owned(),
                urlencoding::encode(v).into_owned(),
            )
        })
        .collect::<Vec<_>>();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

// ============================================================================
// XML Parsing
// ============================================================================

mod xml {
    use super::AwsError;
    use quick_xml::events::Event;
    use quick_xml::Reader;
    use std::collections::HashMap;

    /// Message fields as they appear in a `ReceiveMessage` response
    #[derive(Debug, Default)]
    pub(super) struct RawMessage {
        pub message_id: Option<String>,
        pub receipt_handle: Option<String>,
        pub body: Option<String>,
        pub attributes: HashMap<String, String>,
    }

    /// Failed entry of a batch response
    #[derive(Debug)]
    pub(super) struct BatchErrorEntry {
        pub id: String,
        pub code: String,
    }

    fn parse_error(e: impl std::fmt::Display) -> AwsError {
        AwsError::SerializationError(format!("XML parsing error: {}", e))
    }

    pub(super) fn parse_queue_url(xml: &str) -> Result<String, AwsError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut in_queue_url = false;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"QueueUrl" => {
                    in_queue_url = true;
                }
                Ok(Event::Text(e)) if in_queue_url => {
                    return e.unescape().map(|s| s.into_owned()).map_err(parse_error);
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(parse_error(e)),
                _ => {}
            }
            buf.clear();
        }

        Err(AwsError::SerializationError(
            "QueueUrl not found in response".to_string(),
        ))
    }

    /// Extract `(code, message)` from an `ErrorResponse` document
    pub(super) fn parse_error_response(xml: &str) -> (Option<String>, Option<String>) {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut error_code = None;
        let mut error_message = None;
        let mut in_error = false;
        let mut in_code = false;
        let mut in_message = false;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => match e.name().as_ref() {
                    b"Error" => in_error = true,
                    b"Code" if in_error => in_code = true,
                    b"Message" if in_error => in_message = true,
                    _ => {}
                },
                Ok(Event::Text(e)) => {
                    if in_code {
                        error_code = e.unescape().ok().map(|s| s.into_owned());
                        in_code = false;
                    } else if in_message {
                        error_message = e.unescape().ok().map(|s| s.into_owned());
                        in_message = false;
                    }
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"Error" => {
                    in_error = false;
                }
                Ok(Event::Eof) | Err(_) => break,
                _ => {}
            }
            buf.clear();
        }

        (error_code, error_message)
    }

    pub(super) fn parse_receive_message(xml: &str) -> Result<Vec<RawMessage>, AwsError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Field {
            None,
            MessageId,
            ReceiptHandle,
            Body,
            AttributeName,
            AttributeValue,
        }

        let mut reader = Reader::from_str(xml);
        // Bodies keep their whitespace; text between elements is ignored below.
        reader.trim_text(false);

        let mut messages = Vec::new();
        let mut current: Option<RawMessage> = None;
        let mut in_attribute = false;
        let mut attribute_name: Option<String> = None;
        let mut field = Field::None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    field = match (e.name().as_ref(), current.is_some(), in_attribute) {
                        (b"Message", _, _) => {
                            current = Some(RawMessage::default());
                            Field::None
                        }
                        (b"Attribute", true, _) => {
                            in_attribute = true;
                            attribute_name = None;
                            Field::None
                        }
                        (b"MessageId", true, false) => Field::MessageId,
                        (b"ReceiptHandle", true, false) => Field::ReceiptHandle,
                        (b"Body", true, false) => Field::Body,
                        (b"Name", true, true) => Field::AttributeName,
                        (b"Value", true, true) => Field::AttributeValue,
                        _ => Field::None,
                    };
                }
                Ok(Event::Text(e)) if field == Field::Body => {
                    let text = e.unescape().map_err(parse_error)?;
                    if let Some(message) = current.as_mut() {
                        message.body.get_or_insert_with(String::new).push_str(&text);
                    }
                }
                Ok(Event::CData(e)) if field == Field::Body => {
                    let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    if let Some(message) = current.as_mut() {
                        message.body.get_or_insert_with(String::new).push_str(&text);
                    }
                }
                Ok(Event::Text(e)) if field != Field::None => {
                    let text = e.unescape().map_err(parse_error)?.trim().to_string();
                    if let Some(message) = current.as_mut() {
                        match field {
                            Field::MessageId => message.message_id = Some(text),
                            Field::ReceiptHandle => message.receipt_handle = Some(text),
                            Field::AttributeName => attribute_name = Some(text),
                            Field::AttributeValue => {
                                if let Some(name) = attribute_name.take() {
                                    message.attributes.insert(name, text);
                                }
                            }
                            Field::Body | Field::None => {}
                        }
                    }
                    field = Field::None;
                }
                Ok(Event::End(ref e)) => {
                    field = Field::None;
                    match e.name().as_ref() {
                        b"Attribute" => in_attribute = false,
                        b"Message" => {
                            if let Some(message) = current.take() {
                                messages.push(message);
                            }
                        }
                        _ => {}
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

    /// Collect the `BatchResultErrorEntry` elements of a batch response
    pub(super) fn parse_batch_errors(xml: &str) -> Result<Vec<BatchErrorEntry>, AwsError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut failures = Vec::new();
        let mut in_error_entry = false;
        let mut in_id = false;
        let mut in_code = false;
        let mut id: Option<String> = None;
        let mut code: Option<String> = None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => match e.name().as_ref() {
                    b"BatchResultErrorEntry" => {
                        in_error_entry = true;
                        id = None;
                        code = None;
                    }
                    b"Id" if in_error_entry => in_id = true,
                    b"Code" if in_error_entry => in_code = true,
                    _ => {}
                },
                Ok(Event::Text(e)) if in_id || in_code => {
                    let text = e.unescape().map_err(parse_error)?.into_owned();
                    if in_id {
                        id = Some(text);
                    } else {
                        code = Some(text);
                    }
                    in_id = false;
                    in_code = false;
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"BatchResultErrorEntry" => {
                    in_error_entry = false;
                    if let Some(id) = id.take() {
                        failures.push(BatchErrorEntry {
                            id,
                            code: code.take().unwrap_or_else(|| "Unknown".to_string()),
                        });
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(parse_error(e)),
                _ => {}
            }
            buf.clear();
        }

        Ok(failures)
    }
}

// ============================================================================
// AWS SQS Provider
// ============================================================================

/// AWS SQS queue provider implementation
///
/// ## Thread Safety
///
/// The provider is thread-safe and can be shared across async tasks using `Arc`.
/// The queue URL cache is protected by `RwLock`.
pub struct AwsSqsProvider {
    http_client: HttpClient,
    signer: Option<AwsV4Signer>,
    config: AwsSqsConfig,
    endpoint: String,
    host: String,
    queue_url_cache: Arc<RwLock<HashMap<QueueName, String>>>,
}

impl AwsSqsProvider {
    /// Create new AWS SQS provider
    ///
    /// # Errors
    ///
    /// Returns error if the region is empty, the endpoint is not a valid URL
    /// or the HTTP client cannot be built.
    pub fn new(config: AwsSqsConfig) -> Result<Self, AwsError> {
        if config.region.is_empty() {
            return Err(AwsError::ConfigurationError(
                "Region cannot be empty".to_string(),
            ));
        }

        let signer = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key), Some(secret_key)) => Some(AwsV4Signer::new(
                access_key.clone(),
                secret_key.clone(),
                config.session_token.clone(),
                config.region.clone(),
            )),
            _ => None,
        };

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", config.region));
        let endpoint = endpoint.trim_end_matches('/').to_string();

        let parsed = url::Url::parse(&endpoint)
            .map_err(|e| AwsError::ConfigurationError(format!("Invalid endpoint: {}", e)))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(AwsError::ConfigurationError(format!(
                    "Endpoint has no host: {}",
                    endpoint
                )))
            }
        };

        let http_client = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AwsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            signer,
            config,
            endpoint,
            host,
            queue_url_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Get queue URL for a queue name, with caching
    async fn get_queue_url(&self, queue_name: &QueueName) -> Result<String, AwsError> {
        {
            let cache = self.queue_url_cache.read().await;
            if let Some(url) = cache.get(queue_name) {
                return Ok(url.clone());
            }
        }

        let params = vec![
            ("Action".to_string(), "GetQueueUrl".to_string()),
            ("QueueName".to_string(), queue_name.as_str().to_string()),
        ];
        let response = self.make_request(params).await?;
        let queue_url = xml::parse_queue_url(&response)?;

        debug!(queue = %queue_name, queue_url = %queue_url, "Resolved queue URL");
        self.queue_url_cache
            .write()
            .await
            .insert(queue_name.clone(), queue_url.clone());

        Ok(queue_url)
    }

    /// Drop a cached URL once SQS reports the queue gone, so a recreated
    /// queue is resolved again.
    async fn forget_queue_url(&self, queue_name: &QueueName) {
        self.queue_url_cache.write().await.remove(queue_name);
    }

    /// Resolve the queue URL and run one action against it
    async fn queue_action(
        &self,
        queue: &QueueName,
        action: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<String, AwsError> {
        let queue_url = self.get_queue_url(queue).await?;
        params.push(("Action".to_string(), action.to_string()));
        params.push(("QueueUrl".to_string(), queue_url));

        let result = self.make_request(params).await;
        if let Err(AwsError::QueueNotFound(_)) = &result {
            self.forget_queue_url(queue).await;
        }
        result
    }

    /// Make a signed HTTP request to the SQS Query API
    async fn make_request(&self, mut params: Vec<(String, String)>) -> Result<String, AwsError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| AwsError::Authentication("No credentials configured".to_string()))?;

        params.push(("Version".to_string(), API_VERSION.to_string()));
        let query = canonical_query_string(&params);

        let timestamp = Utc::now();
        let auth_headers = signer.sign_request("POST", &self.host, "/", &query, "", &timestamp)?;

        let url = format!("{}/?{}", self.endpoint, query);
        let mut request = self.http_client.post(&url);
        for (key, value) in auth_headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AwsError::Timeout(e.to_string())
            } else if e.is_connect() {
                AwsError::NetworkError(format!("Connection failed: {}", e))
            } else {
                AwsError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| AwsError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(Self::error_from_response(&response_body, status.as_u16()));
        }

        Ok(response_body)
    }

    /// Map an SQS error document to an [`AwsError`]
    fn error_from_response(xml: &str, status_code: u16) -> AwsError {
        let (code, message) = xml::parse_error_response(xml);
        let code = code.unwrap_or_else(|| "Unknown".to_string());
        let message = message.unwrap_or_else(|| "Unknown error".to_string());

        match code.as_str() {
            "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
                AwsError::QueueNotFound(message)
            }
            "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
                AwsError::Authentication(format!("{}: {}", code, message))
            }
            "InvalidReceiptHandle"
            | "ReceiptHandleIsInvalid"
            | "AWS.SimpleQueueService.MessageNotInflight" => AwsError::InvalidReceipt(message),
            _ if status_code == 401 || status_code == 403 => {
                AwsError::Authentication(format!("{}: {}", code, message))
            }
            _ if status_code == 404 => AwsError::QueueNotFound(message),
            _ => AwsError::ServiceError {
                status: status_code,
                code,
                message,
            },
        }
    }

    fn build_received_message(raw: xml::RawMessage) -> Result<ReceivedMessage, AwsError> {
        let receipt = raw.receipt_handle.ok_or_else(|| {
            AwsError::SerializationError("Message without ReceiptHandle".to_string())
        })?;
        let receipt_handle = ReceiptHandle::new(receipt)
            .map_err(|e| AwsError::SerializationError(e.to_string()))?;
        let message_id = raw
            .message_id
            .as_deref()
            .and_then(|id| MessageId::from_str(id).ok())
            .unwrap_or_default();

        Ok(ReceivedMessage {
            message_id,
            receipt_handle,
            body: bytes::Bytes::from(raw.body.unwrap_or_default()),
            attributes: raw.attributes,
        })
    }
}

impl fmt::Debug for AwsSqsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsSqsProvider")
            .field("config", &self.config)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait]
impl QueueClient for AwsSqsProvider {
    async fn receive_batch(
        &self,
        queue: &QueueName,
        max_count: u32,
        visibility_timeout: Duration,
        attribute_names: &[String],
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let max_size = ProviderType::AwsSqs.max_batch_size();
        if max_count > max_size {
            return Err(QueueError::BatchTooLarge {
                size: max_count as usize,
                max_size: max_size as usize,
            });
        }

        let mut params = vec![
            ("MaxNumberOfMessages".to_string(), max_count.to_string()),
            (
                "VisibilityTimeout".to_string(),
                visibility_timeout.as_secs().to_string(),
            ),
            // The host schedules its own waits between polls.
            ("WaitTimeSeconds".to_string(), "0".to_string()),
        ];
        for (index, name) in attribute_names.iter().enumerate() {
            params.push((format!("AttributeName.{}", index + 1), name.clone()));
        }

        let response = self
            .queue_action(queue, "ReceiveMessage", params)
            .await
            .map_err(|e| e.to_queue_error())?;

        xml::parse_receive_message(&response)
            .and_then(|raw| {
                raw.into_iter()
                    .map(Self::build_received_message)
                    .collect::<Result<Vec<_>, _>>()
            })
            .map_err(|e| e.to_queue_error())
    }

    async fn delete(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<DeleteOutcome, QueueError> {
        let params = vec![(
            "ReceiptHandle".to_string(),
            receipt.as_str().to_string(),
        )];

        match self.queue_action(queue, "DeleteMessage", params).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(AwsError::QueueNotFound(message)) | Err(AwsError::InvalidReceipt(message)) => {
                debug!(queue = %queue, receipt = %receipt, reason = %message, "Message already gone");
                Ok(DeleteOutcome::NotFound)
            }
            Err(e) => Err(e.to_queue_error()),
        }
    }

    async fn change_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError> {
        let params = vec![
            ("ReceiptHandle".to_string(), receipt.as_str().to_string()),
            ("VisibilityTimeout".to_string(), timeout.as_secs().to_string()),
        ];

        // SQS keeps the receipt handle valid across visibility changes.
        self.queue_action(queue, "ChangeMessageVisibility", params)
            .await
            .map(|_| receipt.clone())
            .map_err(|e| match e {
                AwsError::InvalidReceipt(_) => QueueError::MessageNotFound {
                    receipt: receipt.to_string(),
                },
                other => other.to_queue_error(),
            })
    }

    async fn change_visibility_batch(
        &self,
        queue: &QueueName,
        receipts: &[ReceiptHandle],
        timeout: Duration,
    ) -> Result<Vec<ReceiptHandle>, QueueError> {
        let mut failed = Vec::new();

        for (chunk_index, chunk) in receipts.chunks(MAX_BATCH_ENTRIES).enumerate() {
            let mut params = Vec::with_capacity(chunk.len() * 3);
            for (offset, receipt) in chunk.iter().enumerate() {
                let entry = offset + 1;
                let id = format!("m{}", chunk_index * MAX_BATCH_ENTRIES + offset);
                params.push((format!("ChangeMessageVisibilityBatchRequestEntry.{}.Id", entry), id));
                params.push((
                    format!("ChangeMessageVisibilityBatchRequestEntry.{}.ReceiptHandle", entry),
                    receipt.as_str().to_string(),
                ));
                params.push((
                    format!("ChangeMessageVisibilityBatchRequestEntry.{}.VisibilityTimeout", entry),
                    timeout.as_secs().to_string(),
                ));
            }

            let response = self
                .queue_action(queue, "ChangeMessageVisibilityBatch", params)
                .await
                .map_err(|e| e.to_queue_error())?;

            for entry in xml::parse_batch_errors(&response).map_err(|e| e.to_queue_error())? {
                warn!(
                    queue = %queue,
                    entry = %entry.id,
                    code = %entry.code,
                    "Visibility change rejected for batch entry"
                );
                failed.push(entry.id);
            }
        }

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
        ProviderType::AwsSqs
    }
}
