//! Kafka broker backed by rdkafka.
//!
//! The producer awaits the delivery report of every message it sends, and
//! each consumer wraps a `StreamConsumer` whose `recv` is bounded by the
//! caller's poll timeout so cancellation is observed promptly. Manual
//! consumers commit the explicit offsets they are given, never the fetch
//! position.
//!
//! # Example
//!
//! ```rust,no_run
//! use visitstream::broker::{Broker, BrokerProducer, KafkaBroker, KafkaSettings};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let broker = KafkaBroker::new(KafkaSettings::new("localhost:9092"));
//! broker.check_connection(std::time::Duration::from_secs(10)).await?;
//! let producer = broker.producer()?;
//! producer.send("visits", "10.0.0.1", b"{}").await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication, TopicResult};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::KafkaSettings;
use super::{
    Broker, BrokerConsumer, BrokerError, BrokerProducer, ConsumedMessage, Delivery, PollOutcome,
};

fn client_config(settings: Vec<(String, String)>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in settings {
        config.set(key, value);
    }
    config
}

/// Maps a consume-time client error onto [`BrokerError`], marking
/// librdkafka fatal errors as fatal.
pub fn classify_consume_error(err: &KafkaError) -> BrokerError {
    let fatal = matches!(err.rdkafka_error_code(), Some(RDKafkaErrorCode::Fatal));
    BrokerError::Consume {
        message: err.to_string(),
        fatal,
    }
}

/// Interprets one topic creation result; an existing topic is not an error.
///
/// Returns `true` if the topic was created by this call.
fn check_created(result: TopicResult) -> Result<bool, BrokerError> {
    match result {
        Ok(_) => Ok(true),
        Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => Ok(false),
        Err((topic, code)) => Err(BrokerError::Client(format!(
            "failed to create topic {}: {}",
            topic, code
        ))),
    }
}

/// Kafka connection factory.
#[derive(Debug, Clone)]
pub struct KafkaBroker {
    settings: KafkaSettings,
}

impl KafkaBroker {
    pub fn new(settings: KafkaSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &KafkaSettings {
        &self.settings
    }

    /// Fetches cluster metadata to prove the brokers are reachable.
    ///
    /// Returns the number of brokers in the cluster.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Client` if the metadata request fails or
    /// times out.
    pub async fn check_connection(&self, timeout: Duration) -> Result<usize, BrokerError> {
        let config = client_config(self.settings.common_settings());
        let brokers = self.settings.brokers.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = config
                .create()
                .map_err(|e| BrokerError::Client(e.to_string()))?;
            consumer
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
                .map_err(|e| BrokerError::Client(e.to_string()))
        });

        let count = handle
            .await
            .map_err(|e| BrokerError::Client(format!("metadata task failed: {}", e)))??;

        info!(brokers = %brokers, broker_count = count, "Kafka connection verified");
        Ok(count)
    }

    /// Creates `topic` if the cluster metadata does not list it.
    ///
    /// Returns `true` if the topic was created, `false` if it already
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Client` if metadata cannot be fetched or the
    /// admin request fails for any reason other than the topic existing.
    pub async fn ensure_topic(
        &self,
        topic: &str,
        partitions: i32,
        replication: i32,
        timeout: Duration,
    ) -> Result<bool, BrokerError> {
        let config = client_config(self.settings.common_settings());

        let metadata_config = config.clone();
        let wanted = topic.to_string();
        let exists = tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = metadata_config
                .create()
                .map_err(|e| BrokerError::Client(e.to_string()))?;
            consumer
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.topics().iter().any(|t| t.name() == wanted))
                .map_err(|e| BrokerError::Client(e.to_string()))
        })
        .await
        .map_err(|e| BrokerError::Client(format!("metadata task failed: {}", e)))??;

        if exists {
            debug!(topic = %topic, "Topic already exists");
            return Ok(false);
        }

        let admin: AdminClient<DefaultClientContext> = config
            .create()
            .map_err(|e| BrokerError::Client(e.to_string()))?;
        let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(replication));
        let options = AdminOptions::new().operation_timeout(Some(timeout));

        let results = admin
            .create_topics(&[new_topic], &options)
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))?;

        let mut created = false;
        for result in results {
            created |= check_created(result)?;
        }
        if created {
            info!(topic = %topic, partitions, replication, "Topic created");
        } else {
            warn!(topic = %topic, "Topic appeared while it was being created");
        }
        Ok(created)
    }
}

impl Broker for KafkaBroker {
    fn producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        let producer: FutureProducer = client_config(self.settings.producer_settings())
            .create()
            .map_err(|e| BrokerError::Client(e.to_string()))?;

        debug!(brokers = %self.settings.brokers, "Kafka producer created");

        Ok(Arc::new(KafkaProducer {
            producer,
            delivery_timeout: self.settings.delivery_timeout,
        }))
    }

    fn consumer(
        &self,
        group_id: &str,
        manual_commit: bool,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let consumer: StreamConsumer =
            client_config(self.settings.consumer_settings(group_id, manual_commit))
                .create()
                .map_err(|e| BrokerError::Client(e.to_string()))?;

        debug!(
            brokers = %self.settings.brokers,
            group_id = %group_id,
            manual_commit,
            "Kafka consumer created"
        );

        Ok(Box::new(KafkaConsumer {
            consumer: Arc::new(consumer),
            topic: None,
        }))
    }
}

/// Producer that waits for the delivery report of each message.
pub struct KafkaProducer {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, BrokerError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, self.delivery_timeout).await {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((err, _message)) => Err(BrokerError::Delivery(err.to_string())),
        }
    }
}

/// Consumer handle owned by a single loop.
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    topic: Option<String>,
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::Subscription(e.to_string()))?;
        self.topic = Some(topic.to_string());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> PollOutcome {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => PollOutcome::Empty,
            Ok(Ok(message)) => PollOutcome::Message(ConsumedMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec),
            }),
            Ok(Err(KafkaError::PartitionEOF(partition))) => {
                PollOutcome::Ignored(format!("end of partition {}", partition))
            }
            Ok(Err(err)) => PollOutcome::Error(classify_consume_error(&err)),
        }
    }

    async fn commit(&mut self, offsets: &[(i32, i64)]) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let Some(topic) = self.topic.as_deref() else {
            return Err(BrokerError::Commit("consumer is not subscribed".to_string()));
        };

        let mut list = TopicPartitionList::new();
        for &(partition, next) in offsets {
            list.add_partition_offset(topic, partition, Offset::Offset(next))
                .map_err(|e| BrokerError::Commit(e.to_string()))?;
        }

        // A synchronous commit blocks on the group coordinator.
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Commit(format!("commit task failed: {}", e)))?
            .map_err(|e| BrokerError::Commit(e.to_string()))
    }

    fn close(&mut self) {
        self.consumer.unsubscribe();
        self.topic = None;
    }
}
