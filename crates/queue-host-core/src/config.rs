//! Host configuration and its startup validation.
//!
//! Every rule here is checked once by [`HostConfig::validate`] before the
//! first receive. Nothing is re-validated while the host runs.

use crate::error::ConfigurationError;
use crate::message::QueueName;
use crate::provider::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest renewal cadence accepted for message leases and the singleton lock
pub const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(1);

/// Longest lease the in-memory lock accepts (one day)
pub const MAX_IN_MEMORY_LEASE_SECS: u64 = 86_400;

/// Execution topology, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Drain the queue, then exit
    #[default]
    Job,
    /// Poll continuously until cancelled
    Listener,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Job => write!(f, "job"),
            Self::Listener => write!(f, "listener"),
        }
    }
}

/// Complete host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub mode: RunMode,

    pub host: HostOptions,

    #[serde(default)]
    pub listener: ListenerOptions,

    /// Present when the host runs as a fleet-wide singleton
    #[serde(default)]
    pub singleton: Option<SingletonOptions>,

    #[serde(default)]
    pub provider: ProviderConfig,
}

impl HostConfig {
    /// Create a job-mode configuration with defaults for `queue`
    pub fn new(queue: QueueName) -> Self {
        Self {
            mode: RunMode::Job,
            host: HostOptions::new(queue),
            listener: ListenerOptions::default(),
            singleton: None,
            provider: ProviderConfig::default(),
        }
    }

    /// Validate every section; fails on the first violation
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.provider.validate()?;
        self.host
            .validate(self.provider.provider_type().max_batch_size())?;
        self.host.validate_visibility_timeout(
            self.provider.provider_type().max_visibility_timeout_secs(),
        )?;
        self.listener.validate(self.host.batch_size)?;
        if let Some(singleton) = &self.singleton {
            singleton.validate()?;
        }
        Ok(())
    }

    /// Lock resource key for singleton mode, derived from the queue identity
    pub fn singleton_resource_key(&self) -> Option<String> {
        self.singleton
            .as_ref()
            .map(|options| options.resource_key(&self.host.queue))
    }
}

// ============================================================================
// Host Options
// ============================================================================

fn default_batch_size() -> u32 {
    4
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_attribute_names() -> Vec<String> {
    vec!["All".to_string()]
}

fn default_lease_renewal_ratio() -> f64 {
    0.5
}

fn default_shutdown_grace_period_ms() -> u64 {
    30_000
}

fn default_max_empty_polls() -> u32 {
    1
}

/// Options shared by every run mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostOptions {
    /// Queue to consume
    pub queue: QueueName,

    /// Maximum messages per receive
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Lease length granted on receive and on every renewal
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Provider attributes requested with every receive
    #[serde(default = "default_attribute_names")]
    pub attribute_names: Vec<String>,

    /// Fraction of the visibility window after which an unfinished handler's
    /// lease is renewed
    #[serde(default = "default_lease_renewal_ratio")]
    pub lease_renewal_ratio: f64,

    /// How long in-flight handlers may keep running after cancellation
    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,

    /// Job mode: consecutive empty receives before the queue counts as drained
    #[serde(default = "default_max_empty_polls")]
    pub max_empty_polls: u32,
}

impl HostOptions {
    /// Create options with defaults for `queue`
    pub fn new(queue: QueueName) -> Self {
        Self {
            queue,
            batch_size: default_batch_size(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            attribute_names: default_attribute_names(),
            lease_renewal_ratio: default_lease_renewal_ratio(),
            shutdown_grace_period_ms: default_shutdown_grace_period_ms(),
            max_empty_polls: default_max_empty_polls(),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Interval between lease renewals of a message still being handled
    pub fn lease_renewal_interval(&self) -> Duration {
        self.visibility_timeout().mul_f64(self.lease_renewal_ratio)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    fn validate(&self, max_batch_size: u32) -> Result<(), ConfigurationError> {
        if self.batch_size == 0 || self.batch_size > max_batch_size {
            return Err(ConfigurationError::OutOfRange {
                field: "host.batch_size".to_string(),
                message: format!("must be between 1 and {}", max_batch_size),
            });
        }
        if !(self.lease_renewal_ratio > 0.0 && self.lease_renewal_ratio < 1.0) {
            return Err(ConfigurationError::OutOfRange {
                field: "host.lease_renewal_ratio".to_string(),
                message: "must be greater than 0 and less than 1".to_string(),
            });
        }
        if self.max_empty_polls == 0 {
            return Err(ConfigurationError::OutOfRange {
                field: "host.max_empty_polls".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn validate_visibility_timeout(&self, max_secs: u64) -> Result<(), ConfigurationError> {
        if self.visibility_timeout_secs == 0 || self.visibility_timeout_secs > max_secs {
            return Err(ConfigurationError::OutOfRange {
                field: "host.visibility_timeout_secs".to_string(),
                message: format!("must be between 1 and {}", max_secs),
            });
        }
        if self.lease_renewal_interval() < MIN_RENEWAL_INTERVAL {
            return Err(ConfigurationError::OutOfRange {
                field: "host.lease_renewal_ratio".to_string(),
                message: format!(
                    "renews every {:?}; must be at least {:?}",
                    self.lease_renewal_interval(),
                    MIN_RENEWAL_INTERVAL
                ),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Listener Options
// ============================================================================

/// Adaptive polling settings for listener mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerOptions {
    pub minimum_polling_interval_ms: u64,
    pub maximum_polling_interval_ms: u64,
    /// Received count at or above which the queue counts as busy. Defaults to
    /// half the batch size, rounded up.
    pub new_batch_threshold: Option<u32>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            minimum_polling_interval_ms: 5,
            maximum_polling_interval_ms: 10_000,
            new_batch_threshold: None,
        }
    }
}

impl ListenerOptions {
    pub fn minimum_polling_interval(&self) -> Duration {
        Duration::from_millis(self.minimum_polling_interval_ms)
    }

    pub fn maximum_polling_interval(&self) -> Duration {
        Duration::from_millis(self.maximum_polling_interval_ms)
    }

    /// Threshold in effect for the given batch size
    pub fn effective_new_batch_threshold(&self, batch_size: u32) -> u32 {
        self.new_batch_threshold
            .unwrap_or_else(|| batch_size.div_ceil(2))
    }

    /// Check that the minimum polling interval does not exceed the maximum
    pub fn validate_polling_interval(&self) -> bool {
        self.minimum_polling_interval_ms <= self.maximum_polling_interval_ms
    }

    /// Check that the busy threshold is reachable with the given batch size
    pub fn validate_new_batch_threshold(&self, batch_size: u32) -> bool {
        self.effective_new_batch_threshold(batch_size) <= batch_size
    }

    fn validate(&self, batch_size: u32) -> Result<(), ConfigurationError> {
        if self.minimum_polling_interval_ms == 0 {
            return Err(ConfigurationError::OutOfRange {
                field: "listener.minimum_polling_interval_ms".to_string(),
                message: "must not be negative or zero".to_string(),
            });
        }
        if self.maximum_polling_interval_ms == 0 {
            return Err(ConfigurationError::OutOfRange {
                field: "listener.maximum_polling_interval_ms".to_string(),
                message: "must not be negative or zero".to_string(),
            });
        }
        if !self.validate_polling_interval() {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "listener.minimum_polling_interval_ms ({}) must not be greater than listener.maximum_polling_interval_ms ({})",
                    self.minimum_polling_interval_ms, self.maximum_polling_interval_ms
                ),
            });
        }
        if !self.validate_new_batch_threshold(batch_size) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "listener.new_batch_threshold ({}) must not be greater than host.batch_size ({})",
                    self.effective_new_batch_threshold(batch_size),
                    batch_size
                ),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Singleton Options
// ============================================================================

/// Backing store of the singleton lock
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockBackendConfig {
    /// Process-local lock; only meaningful for tests and single-node runs
    #[default]
    InMemory,
    /// Azure blob lease on a blob named after the resource key
    BlobLease {
        /// Container URL including a SAS token with read/write permissions
        container_url: String,
    },
}

/// Settings for running as a fleet-wide singleton
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SingletonOptions {
    /// Lock resource key; defaults to the queue name
    pub scope: Option<String>,
    pub lease_duration_secs: u64,
    /// Renewal cadence as a fraction of the lease duration
    pub renewal_ratio: f64,
    /// Wait bounds between acquisition attempts while the lock is busy
    pub minimum_polling_interval_ms: u64,
    pub maximum_polling_interval_ms: u64,
    /// Job mode: acquisition attempts before giving up
    pub max_retries: u32,
    pub lock: LockBackendConfig,
}

impl Default for SingletonOptions {
    fn default() -> Self {
        Self {
            scope: None,
            lease_duration_secs: 60,
            renewal_ratio: 0.5,
            minimum_polling_interval_ms: 10_000,
            maximum_polling_interval_ms: 60_000,
            max_retries: 3,
            lock: LockBackendConfig::default(),
        }
    }
}

impl SingletonOptions {
    /// Highest renewal ratio that still leaves margin before the lease lapses
    pub const MAX_RENEWAL_RATIO: f64 = 0.6;

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        self.lease_duration().mul_f64(self.renewal_ratio)
    }

    pub fn minimum_polling_interval(&self) -> Duration {
        Duration::from_millis(self.minimum_polling_interval_ms)
    }

    pub fn maximum_polling_interval(&self) -> Duration {
        Duration::from_millis(self.maximum_polling_interval_ms)
    }

    /// Lock resource key for `queue`
    pub fn resource_key(&self, queue: &QueueName) -> String {
        match &self.scope {
            Some(scope) if !scope.trim().is_empty() => scope.clone(),
            _ => queue.as_str().to_string(),
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let lease_range = match self.lock {
            LockBackendConfig::InMemory => 1..=MAX_IN_MEMORY_LEASE_SECS,
            LockBackendConfig::BlobLease { .. } => 15..=60,
        };
        if !lease_range.contains(&self.lease_duration_secs) {
            return Err(ConfigurationError::OutOfRange {
                field: "singleton.lease_duration_secs".to_string(),
                message: format!(
                    "must be between {} and {}",
                    lease_range.start(),
                    lease_range.end()
                ),
            });
        }
        if !(self.renewal_ratio > 0.0 && self.renewal_ratio <= Self::MAX_RENEWAL_RATIO) {
            return Err(ConfigurationError::OutOfRange {
                field: "singleton.renewal_ratio".to_string(),
                message: format!(
                    "must be greater than 0 and at most {}",
                    Self::MAX_RENEWAL_RATIO
                ),
            });
        }
        if self.renewal_interval() < MIN_RENEWAL_INTERVAL {
            return Err(ConfigurationError::OutOfRange {
                field: "singleton.renewal_ratio".to_string(),
                message: format!(
                    "renews every {:?}; must be at least {:?}",
                    self.renewal_interval(),
                    MIN_RENEWAL_INTERVAL
                ),
            });
        }
        if self.minimum_polling_interval_ms == 0
            || self.minimum_polling_interval_ms > self.maximum_polling_interval_ms
        {
            return Err(ConfigurationError::Invalid {
                message: "singleton polling intervals must be positive with minimum <= maximum"
                    .to_string(),
            });
        }
        if let LockBackendConfig::BlobLease { container_url } = &self.lock {
            url::Url::parse(container_url).map_err(|e| ConfigurationError::Invalid {
                message: format!("singleton.lock.container_url is not a valid URL: {}", e),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
