//! Test utilities for Visitstream
//!
//! Temporary stores, fixed event histories and a polling helper for
//! asynchronous assertions.

use crate::event::VisitEvent;
use crate::storage::SqliteVisitStore;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Creates a store backed by a fresh temporary directory.
///
/// The directory is removed when the returned `TempDir` is dropped, so
/// keep it alive for as long as the store is used.
pub fn temp_store() -> (Arc<SqliteVisitStore>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temporary directory");
    let store = SqliteVisitStore::new_with_path(dir.path().join("visits.db"))
        .expect("Failed to open temporary store");
    (Arc::new(store), dir)
}

/// Midnight UTC on 2020-01-`day`.
pub fn january_2020(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, day, 0, 0, 0)
        .single()
        .expect("valid January 2020 date")
}

/// One visit from `origin_key` on each day of 2020-01-01 to 2020-01-07
/// (Wednesday to Tuesday).
pub fn first_week_of_2020(origin_key: &str) -> Vec<VisitEvent> {
    (1..=7)
        .map(|day| VisitEvent::new(origin_key, january_2020(day)))
        .collect()
}

/// Polls `done` every 10ms, panicking after `timeout`.
pub async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_week_spans_every_weekday() {
        let events = first_week_of_2020("ip");
        let mut days: Vec<_> = events.iter().map(|e| e.weekday().to_string()).collect();
        days.sort();
        days.dedup();
        assert_eq!(days.len(), 7);
        assert_eq!(events[0].weekday(), "Wednesday");
    }
}
