//! Queue provider implementations.
//!
//! This module contains concrete implementations of the `QueueClient` trait
//! for the supported queue backends.

pub mod aws;
pub mod azure;
pub mod memory;

pub use aws::{AwsError, AwsSqsProvider};
pub use azure::AzureQueueProvider;
pub use memory::InMemoryProvider;
