//! Common test utilities for the queue host integration tests
//!
//! This module provides:
//! - A recording handler with configurable failures and delays
//! - Configuration builders for each run mode
//! - In-memory queue fixtures

use async_trait::async_trait;
use queue_host_core::{
    HostConfig, InMemoryProvider, Message, MessageHandler, QueueName, RunMode, SingletonOptions,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Recording Handler
// ============================================================================

/// Handler recording every body it sees
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct RecordingHandler {
    handled: Arc<Mutex<Vec<String>>>,
    failing_bodies: Arc<Mutex<HashSet<String>>>,
    fail_once_bodies: Arc<Mutex<HashSet<String>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every delivery of a message with this body
    pub fn fail_on(self, body: &str) -> Self {
        self.failing_bodies.lock().unwrap().insert(body.to_string());
        self
    }

    /// Fail only the first delivery of a message with this body
    pub fn fail_once_on(self, body: &str) -> Self {
        self.fail_once_bodies.lock().unwrap().insert(body.to_string());
        self
    }

    /// Sleep this long in every invocation
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Bodies handled so far, in completion order, including failures
    pub fn handled(&self) -> Vec<String> {
        self.handled.lock().unwrap().clone()
    }

    pub fn handled_count(&self, body: &str) -> usize {
        self.handled().iter().filter(|b| b.as_str() == body).count()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        message: &Message,
        _cancellation: CancellationToken,
    ) -> anyhow::Result<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let body = message.body_as_str().unwrap_or_default().to_string();
        self.handled.lock().unwrap().push(body.clone());

        if self.fail_once_bodies.lock().unwrap().remove(&body) {
            anyhow::bail!("first delivery of '{}' fails", body);
        }
        if self.failing_bodies.lock().unwrap().contains(&body) {
            anyhow::bail!("refusing to handle '{}'", body);
        }
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn queue() -> QueueName {
    QueueName::new("orders".to_string()).unwrap()
}

/// In-memory queue `orders` holding the given bodies
#[allow(dead_code)]
pub fn seeded_provider(bodies: &[&str]) -> InMemoryProvider {
    let provider = InMemoryProvider::new();
    provider.create_queue(&queue());
    for body in bodies {
        provider.send_message(&queue(), body.to_string());
    }
    provider
}

#[allow(dead_code)]
pub fn job_config() -> HostConfig {
    let mut config = HostConfig::new(queue());
    config.host.batch_size = 4;
    config.host.visibility_timeout_secs = 30;
    config
}

#[allow(dead_code)]
pub fn listener_config() -> HostConfig {
    let mut config = job_config();
    config.mode = RunMode::Listener;
    config.listener.minimum_polling_interval_ms = 100;
    config.listener.maximum_polling_interval_ms = 2_000;
    config
}

#[allow(dead_code)]
pub fn with_singleton(mut config: HostConfig) -> HostConfig {
    config.singleton = Some(SingletonOptions {
        lease_duration_secs: 20,
        minimum_polling_interval_ms: 500,
        maximum_polling_interval_ms: 2_000,
        max_retries: 2,
        ..Default::default()
    });
    config
}

/// Token cancelled after `delay`
#[allow(dead_code)]
pub fn cancel_after(delay: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        canceller.cancel();
    });
    token
}
