//! Visit service façade
//!
//! [`VisitService`] composes the publisher and the store behind the three
//! operations the HTTP API and the CLI need. Filter validation happens
//! here, before the store is touched.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::event::{VisitEvent, VisitsByKey};
use crate::filter::{FilterError, VisitFilter};
use crate::publisher::{EventPublisher, PublishError};
use crate::storage::{StoreError, VisitStore};

/// Errors surfaced to callers of [`VisitService`].
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    InvalidFilter(#[from] FilterError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Publisher and store behind one handle.
#[derive(Clone)]
pub struct VisitService {
    publisher: Arc<dyn EventPublisher>,
    store: Arc<dyn VisitStore>,
}

impl VisitService {
    pub fn new(publisher: Arc<dyn EventPublisher>, store: Arc<dyn VisitStore>) -> Self {
        Self { publisher, store }
    }

    /// Publishes a visit from `origin_key` and waits for the broker.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Publish` if the broker does not confirm the
    /// message.
    pub async fn record_visit(&self, origin_key: &str) -> Result<VisitEvent, ServiceError> {
        Ok(self.publisher.publish_visit(origin_key).await?)
    }

    /// Returns all stored visits narrowed by `query`.
    ///
    /// See [`query_visits`].
    pub async fn get_visits(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<VisitsByKey, ServiceError> {
        query_visits(self.store.as_ref(), query).await
    }

    /// Returns the visits of `key` narrowed by `query`.
    ///
    /// See [`query_visits_by_key`].
    pub async fn get_visits_by_key(
        &self,
        key: &str,
        query: &HashMap<String, String>,
    ) -> Result<VisitsByKey, ServiceError> {
        query_visits_by_key(self.store.as_ref(), key, query).await
    }
}

/// Returns all visits in `store` narrowed by the `gt`, `lt` and `day`
/// parameters in `query`.
///
/// Timestamps are sorted per key and keys with no remaining visits are
/// omitted.
///
/// # Errors
///
/// Returns `ServiceError::InvalidFilter` for malformed parameters (the
/// store is not queried) and `ServiceError::Store` if the scan fails.
pub async fn query_visits(
    store: &dyn VisitStore,
    query: &HashMap<String, String>,
) -> Result<VisitsByKey, ServiceError> {
    let filter = VisitFilter::from_query(query)?;
    debug!(filter = %filter.summary(), "Querying all visits");

    let mut visits = filter.apply(store.get_visits().await?);
    for times in visits.values_mut() {
        times.sort();
    }
    Ok(visits)
}

/// Returns the visits of `key` in `store` narrowed by `query`, as a
/// one-entry map. The map is empty if nothing matches.
///
/// # Errors
///
/// Same as [`query_visits`].
pub async fn query_visits_by_key(
    store: &dyn VisitStore,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<VisitsByKey, ServiceError> {
    let filter = VisitFilter::from_query(query)?;
    debug!(origin_key = %key, filter = %filter.summary(), "Querying visits by key");

    let times = store
        .get_visits_by_key(key, filter.weekday.as_deref(), filter.gt, filter.lt)
        .await?;

    let mut visits = VisitsByKey::new();
    if !times.is_empty() {
        visits.insert(key.to_string(), times);
    }
    Ok(visits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::publisher::Publisher;
    use crate::test_utils::{first_week_of_2020, january_2020 as day, temp_store};
    use tempfile::TempDir;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn service(broker: &MemoryBroker) -> (VisitService, TempDir) {
        let (store, dir) = temp_store();
        // Stored newest first so reads have to sort.
        for event in first_week_of_2020("ip").iter().rev() {
            store.insert_event(event).await.unwrap();
        }
        store.insert_event(&VisitEvent::new("early", day(1))).await.unwrap();

        let publisher = Publisher::new(broker.producer().unwrap(), "visits");
        (VisitService::new(Arc::new(publisher), store), dir)
    }

    #[tokio::test]
    async fn test_get_visits_sorts_each_key() {
        let broker = MemoryBroker::default();
        let (service, _dir) = service(&broker).await;

        let visits = service.get_visits(&query(&[])).await.unwrap();
        assert_eq!(visits["ip"], (1..=7).map(day).collect::<Vec<_>>());
        assert_eq!(visits["early"], vec![day(1)]);
    }

    #[tokio::test]
    async fn test_get_visits_drops_filtered_out_keys() {
        let broker = MemoryBroker::default();
        let (service, _dir) = service(&broker).await;

        let visits = service.get_visits(&query(&[("gt", "2020-01-05")])).await.unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits["ip"], vec![day(5), day(6), day(7)]);
    }

    #[tokio::test]
    async fn test_invalid_filter_is_reported() {
        let broker = MemoryBroker::default();
        let (service, _dir) = service(&broker).await;

        let err = service.get_visits(&query(&[("day", "Funday")])).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidFilter(_)));

        let err = service
            .get_visits_by_key("ip", &query(&[("lt", "soon")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidFilter(_)));
    }

    #[tokio::test]
    async fn test_get_visits_by_key_applies_filters() {
        let broker = MemoryBroker::default();
        let (service, _dir) = service(&broker).await;

        let visits = service
            .get_visits_by_key("ip", &query(&[("lt", "2020-01-05"), ("day", "Wednesday")]))
            .await
            .unwrap();
        assert_eq!(visits["ip"], vec![day(1)]);

        let none = service
            .get_visits_by_key("ip", &query(&[("gt", "2021")]))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_record_visit_publishes() {
        let broker = MemoryBroker::default();
        let (service, _dir) = service(&broker).await;

        let event = service.record_visit("10.0.0.9").await.unwrap();
        assert_eq!(event.origin_key(), "10.0.0.9");
        assert_eq!(broker.message_count("visits"), 1);

        broker.fail_next_deliveries(1);
        let err = service.record_visit("10.0.0.9").await.unwrap_err();
        assert!(matches!(err, ServiceError::Publish(_)));
    }
}
