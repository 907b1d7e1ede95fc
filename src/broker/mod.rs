//! Broker capabilities
//!
//! The publisher and the consumption loops depend on the narrow traits in
//! this module rather than on a concrete client, so the same pipeline runs
//! against Kafka in production and against the in-process
//! [`memory::MemoryBroker`] in tests and demo mode.
//!
//! # Submodules
//!
//! - [`config`]: Kafka connection settings (TLS, SASL)
//! - [`kafka`]: rdkafka-backed producer and consumer
//! - [`memory`]: in-process broker with partitions and consumer groups

pub mod config;
pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use config::KafkaSettings;
pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;

/// Errors reported by a broker client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Client could not be created.
    #[error("Client creation failed: {0}")]
    Client(String),

    /// Subscribing to a topic failed.
    #[error("Subscription failed: {0}")]
    Subscription(String),

    /// The broker rejected a message or never confirmed it.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Committing consumed offsets failed.
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Error surfaced while consuming.
    #[error("Consumer error: {message}")]
    Consume {
        /// Error description from the client.
        message: String,
        /// Whether the connection is unusable from now on.
        fatal: bool,
    },
}

impl BrokerError {
    /// Returns true when the client cannot be used any more.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Consume { fatal: true, .. })
    }
}

/// Broker confirmation for one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// A message read from a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Result of one bounded poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// Nothing arrived before the timeout.
    Empty,
    /// A message is ready for dispatch.
    Message(ConsumedMessage),
    /// The client reported an error.
    Error(BrokerError),
    /// The client produced something the loop has no use for.
    Ignored(String),
}

/// Producing side of the broker.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Sends `payload` to `topic`, routed by `key`, and waits for the
    /// broker's confirmation of that specific message.
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, BrokerError>;
}

/// Consuming side of the broker; one instance per loop.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Joins the consumer group on `topic`.
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Waits at most `timeout` for the next message or client event.
    ///
    /// Must be cancel safe: dropping the future never loses a message.
    async fn poll(&mut self, timeout: Duration) -> PollOutcome;

    /// Commits `offsets` for the subscribed topic.
    ///
    /// Each entry is `(partition, next_offset)`: the offset the group
    /// resumes from on that partition. Partitions not listed keep their
    /// previous commit.
    async fn commit(&mut self, offsets: &[(i32, i64)]) -> Result<(), BrokerError>;

    /// Leaves the group and releases the handle.
    fn close(&mut self);
}

/// Factory for producer and consumer handles.
pub trait Broker: Send + Sync {
    /// Creates the shared producer.
    fn producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError>;

    /// Creates a fresh consumer handle in `group_id`.
    fn consumer(
        &self,
        group_id: &str,
        manual_commit: bool,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fatal_consume_errors_are_fatal() {
        let fatal = BrokerError::Consume {
            message: "fenced".to_string(),
            fatal: true,
        };
        let transient = BrokerError::Consume {
            message: "broker transport failure".to_string(),
            fatal: false,
        };
        assert!(fatal.is_fatal());
        assert!(!transient.is_fatal());
        assert!(!BrokerError::Commit("no offset".to_string()).is_fatal());
    }

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::Delivery("message timed out".to_string());
        assert_eq!(err.to_string(), "Delivery failed: message timed out");
    }
}
