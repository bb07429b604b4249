//! Provider types and configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    AwsSqs,
    AzureQueue,
    InMemory,
}

impl ProviderType {
    /// Largest number of messages a single receive may request
    pub fn max_batch_size(&self) -> u32 {
        match self {
            Self::AwsSqs => 10,
            Self::AzureQueue => 32,
            Self::InMemory => 32,
        }
    }

    /// Longest visibility timeout the provider accepts, in seconds
    pub fn max_visibility_timeout_secs(&self) -> u64 {
        match self {
            Self::AwsSqs => 43_200, // 12 hours
            Self::AzureQueue | Self::InMemory => 7 * 24 * 3600,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwsSqs => write!(f, "AwsSqs"),
            Self::AzureQueue => write!(f, "AzureQueue"),
            Self::InMemory => write!(f, "InMemory"),
        }
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    AwsSqs(AwsSqsConfig),
    AzureQueue(AzureQueueConfig),
    InMemory,
}

impl ProviderConfig {
    /// Provider this configuration selects
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::AwsSqs(_) => ProviderType::AwsSqs,
            Self::AzureQueue(_) => ProviderType::AzureQueue,
            Self::InMemory => ProviderType::InMemory,
        }
    }

    /// Validate provider settings
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::AwsSqs(aws) => aws.validate(),
            Self::AzureQueue(azure) => azure.validate(),
            Self::InMemory => Ok(()),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::InMemory
    }
}

/// AWS SQS configuration
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AwsSqsConfig {
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    /// Overrides `https://sqs.{region}.amazonaws.com`, e.g. for LocalStack
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl AwsSqsConfig {
    /// Fill missing credentials from the standard AWS environment variables
    pub fn with_env_credentials(mut self) -> Self {
        if self.access_key_id.is_none() {
            self.access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok();
        }
        if self.secret_access_key.is_none() {
            self.secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok();
        }
        if self.session_token.is_none() {
            self.session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        }
        self
    }

    /// Validate SQS settings
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.region.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "provider.region".to_string(),
            });
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(ConfigurationError::Invalid {
                message: "access_key_id and secret_access_key must be set together".to_string(),
            });
        }
        if let Some(endpoint) = &self.endpoint {
            url::Url::parse(endpoint).map_err(|e| ConfigurationError::Invalid {
                message: format!("provider.endpoint is not a valid URL: {}", e),
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AwsSqsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSqsConfig")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<REDACTED>"),
            )
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Azure Queue Storage configuration
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AzureQueueConfig {
    /// Queue service endpoint carrying a SAS token, e.g.
    /// `https://account.queue.core.windows.net/?sv=...&sig=...`
    #[serde(default)]
    pub queue_service_url: String,
}

impl AzureQueueConfig {
    /// Environment variable read when no service URL is configured
    pub const SERVICE_URL_ENV: &'static str = "AZURE_QUEUE_SERVICE_URL";

    /// Fill a missing service URL from `AZURE_QUEUE_SERVICE_URL`
    pub fn with_env_url(mut self) -> Self {
        if self.queue_service_url.trim().is_empty() {
            if let Ok(url) = std::env::var(Self::SERVICE_URL_ENV) {
                self.queue_service_url = url;
            }
        }
        self
    }

    /// Validate Azure Queue settings
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.queue_service_url.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "provider.queue_service_url".to_string(),
            });
        }
        let url = url::Url::parse(&self.queue_service_url).map_err(|e| {
            ConfigurationError::Invalid {
                message: format!("provider.queue_service_url is not a valid URL: {}", e),
            }
        })?;
        if url.cannot_be_a_base() {
            return Err(ConfigurationError::Invalid {
                message: "provider.queue_service_url cannot carry a queue path".to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for AzureQueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The query string holds the SAS signature.
        let redacted = match url::Url::parse(&self.queue_service_url) {
            Ok(mut url) => {
                url.set_query(None);
                url.to_string()
            }
            Err(_) => "<unparseable>".to_string(),
        };
        f.debug_struct("AzureQueueConfig")
            .field("queue_service_url", &redacted)
            .finish()
    }
}
