//! Visit publisher
//!
//! Turns a "visit happened" fact into a [`VisitEvent`], hands it to the
//! broker keyed by its origin, and returns only once the broker has
//! confirmed delivery of that specific message. Failures are surfaced to
//! the caller unchanged; retry policy belongs to the caller.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::broker::{BrokerError, BrokerProducer, Delivery};
use crate::codec::{self, CodecError};
use crate::event::VisitEvent;

/// Errors returned when a visit could not be recorded on the broker.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The event could not be encoded.
    #[error("Failed to encode visit: {0}")]
    Encoding(#[from] CodecError),

    /// The broker rejected the message or did not confirm it.
    #[error("Broker did not confirm delivery: {0}")]
    Broker(#[from] BrokerError),
}

/// Capability to record visits on the broker.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes `event` and waits for the broker's confirmation.
    async fn publish(&self, event: &VisitEvent) -> Result<Delivery, PublishError>;

    /// Creates an event for `origin_key` stamped now and publishes it.
    async fn publish_visit(&self, origin_key: &str) -> Result<VisitEvent, PublishError> {
        let event = VisitEvent::now(origin_key);
        self.publish(&event).await?;
        Ok(event)
    }
}

/// Publisher writing to a single fixed topic.
#[derive(Clone)]
pub struct Publisher {
    producer: Arc<dyn BrokerProducer>,
    topic: String,
}

impl Publisher {
    pub fn new(producer: Arc<dyn BrokerProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl EventPublisher for Publisher {
    async fn publish(&self, event: &VisitEvent) -> Result<Delivery, PublishError> {
        let payload = codec::encode(event)?;

        match self
            .producer
            .send(&self.topic, event.origin_key(), &payload)
            .await
        {
            Ok(delivery) => {
                debug!(
                    topic = %self.topic,
                    origin_key = %event.origin_key(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Visit delivered"
                );
                Ok(delivery)
            }
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    origin_key = %event.origin_key(),
                    error = %e,
                    "Visit delivery failed"
                );
                Err(e.into())
            }
        }
    }
}
