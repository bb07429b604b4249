//! Azure Blob Storage lease collaborator.
//!
//! Each resource key maps to an empty blob in a container; holding the
//! singleton lock means holding the blob's lease. Requests go straight to the
//! Blob REST API (`comp=lease`) and authenticate with the SAS token carried
//! in the container URL.
//!
//! Status mapping:
//! - acquire: `201` acquired, `409` busy, `404` creates the blob and retries
//! - renew: `200` renewed, `409`/`412` lost
//! - release: `200` released

use super::{AcquireOutcome, LockCollaborator, LockToken};
use crate::error::LockError;
use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[cfg(test)]
#[path = "blob_lease_tests.rs"]
mod tests;

const STORAGE_API_VERSION: &str = "2021-08-06";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock collaborator backed by Azure blob leases
pub struct BlobLeaseLock {
    http_client: HttpClient,
    container_url: Url,
}

impl BlobLeaseLock {
    /// Create a collaborator for the container at `container_url`.
    ///
    /// The URL should carry a SAS token allowing blob create, read and write.
    pub fn new(container_url: &str) -> Result<Self, LockError> {
        let container_url = Url::parse(container_url).map_err(|e| LockError::Invalid {
            message: format!("invalid container URL: {}", e),
        })?;
        if container_url.cannot_be_a_base() {
            return Err(LockError::Invalid {
                message: "container URL cannot carry a blob path".to_string(),
            });
        }

        let http_client = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LockError::Transport {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            container_url,
        })
    }

    /// URL of the lock blob for `resource_key`, keeping the SAS query
    fn blob_url(&self, resource_key: &str) -> Result<Url, LockError> {
        let mut url = self.container_url.clone();
        url.path_segments_mut()
            .map_err(|_| LockError::Invalid {
                message: "container URL cannot carry a blob path".to_string(),
            })?
            .pop_if_empty()
            .push(resource_key);
        Ok(url)
    }

    fn lease_url(&self, resource_key: &str) -> Result<Url, LockError> {
        let mut url = self.blob_url(resource_key)?;
        url.query_pairs_mut().append_pair("comp", "lease");
        Ok(url)
    }

    async fn lease_request(
        &self,
        resource_key: &str,
        headers: &[(&str, String)],
    ) -> Result<reqwest::Response, LockError> {
        let mut request = self
            .http_client
            .put(self.lease_url(resource_key)?)
            .header("x-ms-version", STORAGE_API_VERSION)
            .body(Vec::<u8>::new());
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        request.send().await.map_err(transport_error)
    }

    async fn create_blob(&self, resource_key: &str) -> Result<(), LockError> {
        let response = self
            .http_client
            .put(self.blob_url(resource_key)?)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .body(Vec::<u8>::new())
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            // 409/412: another instance created it first
            StatusCode::CREATED | StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                debug!(resource_key = %resource_key, "Lock blob ready");
                Ok(())
            }
            status => Err(status_error("create lock blob", status)),
        }
    }

    async fn try_acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<AcquireOutcome>, LockError> {
        let proposed_lease_id = uuid::Uuid::new_v4().to_string();
        let response = self
            .lease_request(
                resource_key,
                &[
                    ("x-ms-lease-action", "acquire".to_string()),
                    ("x-ms-lease-duration", lease_duration.as_secs().to_string()),
                    ("x-ms-proposed-lease-id", proposed_lease_id.clone()),
                ],
            )
            .await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                let lease_id = response
                    .headers()
                    .get("x-ms-lease-id")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .unwrap_or(proposed_lease_id);
                Ok(Some(AcquireOutcome::Acquired(LockToken::new(
                    resource_key,
                    holder_id,
                    lease_id,
                    lease_duration,
                )?)))
            }
            StatusCode::CONFLICT => Ok(Some(AcquireOutcome::Busy)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(status_error("acquire lease", status)),
        }
    }
}

impl std::fmt::Debug for BlobLeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The query string holds the SAS signature.
        let mut redacted = self.container_url.clone();
        redacted.set_query(None);
        f.debug_struct("BlobLeaseLock")
            .field("container_url", &redacted.as_str())
            .finish()
    }
}

fn transport_error(e: reqwest::Error) -> LockError {
    LockError::Transport {
        message: e.to_string(),
    }
}

fn status_error(operation: &str, status: StatusCode) -> LockError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        LockError::Transport {
            message: format!("{} failed with HTTP {}", operation, status),
        }
    } else {
        LockError::Invalid {
            message: format!("{} rejected with HTTP {}", operation, status),
        }
    }
}

#[async_trait]
impl LockCollaborator for BlobLeaseLock {
    async fn acquire(
        &self,
        resource_key: &str,
        holder_id: &str,
        lease_duration: Duration,
    ) -> Result<AcquireOutcome, LockError> {
        if let Some(outcome) = self
            .try_acquire(resource_key, holder_id, lease_duration)
            .await?
        {
            return Ok(outcome);
        }

        self.create_blob(resource_key).await?;
        self.try_acquire(resource_key, holder_id, lease_duration)
            .await?
            .ok_or_else(|| LockError::Transport {
                message: format!("lock blob '{}' vanished after creation", resource_key),
            })
    }

    async fn renew(&self, token: &LockToken, lease_duration: Duration) -> Result<LockToken, LockError> {
        let response = self
            .lease_request(
                token.resource_key(),
                &[
                    ("x-ms-lease-action", "renew".to_string()),
                    ("x-ms-lease-id", token.lease_id().to_string()),
                ],
            )
            .await?;

        match response.status() {
            StatusCode::OK => token.renewed(lease_duration),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED | StatusCode::NOT_FOUND => {
                Err(LockError::Lost {
                    resource_key: token.resource_key().to_string(),
                })
            }
            status => Err(status_error("renew lease", status)),
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let response = self
            .lease_request(
                token.resource_key(),
                &[
                    ("x-ms-lease-action", "release".to_string()),
                    ("x-ms-lease-id", token.lease_id().to_string()),
                ],
            )
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(status_error("release lease", status)),
        }
    }
}
