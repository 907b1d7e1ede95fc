//! Callbacks plugged into the consumption loops.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use super::{EventHandler, HandlerError};
use crate::event::VisitEvent;
use crate::storage::VisitStore;

/// Persists every consumed visit.
pub struct InsertVisitHandler {
    store: Arc<dyn VisitStore>,
}

impl InsertVisitHandler {
    pub fn new(store: Arc<dyn VisitStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for InsertVisitHandler {
    async fn handle(&self, event: VisitEvent) -> Result<(), HandlerError> {
        self.store.insert_event(&event).await?;
        debug!(origin_key = %event.origin_key(), "Visit stored");
        Ok(())
    }
}

/// Logs the weekday of every consumed visit and keeps a running tally.
#[derive(Debug, Default)]
pub struct DayReporter {
    tally: Mutex<BTreeMap<String, u64>>,
}

impl DayReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visits seen so far, per weekday name.
    pub fn tally(&self) -> BTreeMap<String, u64> {
        self.tally
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventHandler for DayReporter {
    async fn handle(&self, event: VisitEvent) -> Result<(), HandlerError> {
        let seen = {
            let mut tally = self.tally.lock().unwrap_or_else(PoisonError::into_inner);
            let count = tally.entry(event.weekday().to_string()).or_insert(0);
            *count += 1;
            *count
        };

        info!(
            weekday = %event.weekday(),
            origin_key = %event.origin_key(),
            seen,
            "Visit on {}",
            event.weekday()
        );
        Ok(())
    }
}
