/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `serve`   - Run the HTTP API, the insert workers and the report loop
- `publish` - Publish a single visit
- `visits`  - Query the local visit store

Each handler takes a validated [`Config`] and builds the components it
needs from the library.
*/

use crate::config::Config;
use crate::error::{Result, VisitstreamError};
use crate::storage::SqliteVisitStore;

/// Opens the configured store, or the per-user default.
fn open_store(config: &Config) -> Result<SqliteVisitStore> {
    match &config.storage.db_path {
        Some(path) => SqliteVisitStore::new_with_path(path.clone()),
        None => SqliteVisitStore::new(),
    }
}

/// Builds a Kafka broker, proves it is reachable and, if configured,
/// creates the visit topic when the cluster does not have it.
async fn connect_kafka(config: &Config) -> Result<crate::broker::KafkaBroker> {
    let kafka = &config.kafka;
    let broker = crate::broker::KafkaBroker::new(kafka.settings()?);
    broker
        .check_connection(kafka.connect_check_timeout())
        .await
        .map_err(|e| VisitstreamError::Broker(e.to_string()))?;

    if kafka.create_topic {
        let created = broker
            .ensure_topic(
                &kafka.topic,
                kafka.topic_partitions,
                kafka.topic_replication,
                kafka.connect_check_timeout(),
            )
            .await
            .map_err(|e| VisitstreamError::Broker(e.to_string()))?;
        tracing::debug!(topic = %kafka.topic, created, "Topic ready");
    }

    Ok(broker)
}

// Long-running pipeline
pub mod serve {
    //! Runs the pipeline until SIGINT or SIGQUIT.

    use super::*;
    use crate::app::{shutdown_signal, Supervisor};
    use crate::broker::{Broker, MemoryBroker};
    use std::sync::Arc;

    /// Start the pipeline
    ///
    /// # Arguments
    ///
    /// * `config` - Global configuration
    /// * `in_memory` - Use an in-process broker instead of Kafka
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unreachable, the store cannot be
    /// opened, or a pipeline task failed before shutdown completed.
    pub async fn run_serve(config: Config, in_memory: bool) -> Result<()> {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            in_memory,
            "Starting visitstream"
        );

        let addr = config.http.socket_addr()?;
        let broker: Arc<dyn Broker> = if in_memory {
            tracing::warn!("Using in-memory broker, visits are lost on exit");
            Arc::new(MemoryBroker::default())
        } else {
            Arc::new(connect_kafka(&config).await?)
        };

        let store = open_store(&config)?;
        tracing::info!(db_path = %store.db_path().display(), "Visit store opened");

        let supervisor = Supervisor::new(config, broker, Arc::new(store));
        let cancel = supervisor.cancellation_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });

        let report = supervisor.run(addr).await?;
        if report.timed_out {
            return Err(VisitstreamError::Broker(
                "pipeline did not stop within the grace period".to_string(),
            )
            .into());
        }
        if let Some(failure) = report.failures.first() {
            return Err(anyhow::anyhow!("pipeline stopped on failure: {}", failure));
        }

        tracing::info!("Visitstream stopped");
        Ok(())
    }
}

// One-shot publish
pub mod publish {
    //! Publishes one visit to Kafka.

    use super::*;
    use crate::broker::Broker;
    use crate::publisher::{EventPublisher, Publisher};

    /// Publish a visit from `origin` and print it as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if Kafka is unreachable or does not confirm the
    /// message.
    pub async fn run_publish(config: Config, origin: &str) -> Result<()> {
        let broker = connect_kafka(&config).await?;
        let producer = broker
            .producer()
            .map_err(|e| VisitstreamError::Broker(e.to_string()))?;
        let publisher = Publisher::new(producer, config.kafka.topic.clone());

        let event = publisher.publish_visit(origin).await?;
        println!("{}", serde_json::to_string(&event)?);
        Ok(())
    }
}

// Store queries
pub mod visits {
    //! Prints stored visits, filtered like the HTTP API.

    use super::*;
    use crate::filter::{GREATER_THAN_KEY, LESS_THAN_KEY, WEEKDAY_KEY};
    use crate::service::{query_visits, query_visits_by_key};
    use std::collections::HashMap;

    /// Filter arguments of the `visits` command.
    #[derive(Debug, Default, Clone)]
    pub struct VisitsQuery {
        pub key: Option<String>,
        pub gt: Option<String>,
        pub lt: Option<String>,
        pub day: Option<String>,
    }

    impl VisitsQuery {
        /// Query parameters in the form the HTTP API receives them.
        pub fn params(&self) -> HashMap<String, String> {
            [
                (GREATER_THAN_KEY, &self.gt),
                (LESS_THAN_KEY, &self.lt),
                (WEEKDAY_KEY, &self.day),
            ]
            .into_iter()
            .filter_map(|(name, value)| value.as_ref().map(|v| (name.to_string(), v.clone())))
            .collect()
        }
    }

    /// Query the store and print the result as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns an error for malformed filters or if the store cannot be
    /// read.
    pub async fn run_visits(config: Config, query: VisitsQuery) -> Result<()> {
        let store = open_store(&config)?;
        let params = query.params();

        let visits = match &query.key {
            Some(key) => query_visits_by_key(&store, key, &params).await?,
            None => query_visits(&store, &params).await?,
        };

        println!("{}", serde_json::to_string_pretty(&visits)?);
        Ok(())
    }

}
