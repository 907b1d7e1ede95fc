//! Visit event data model
//!
//! A [`VisitEvent`] is created once by the publisher, travels unmodified
//! through the broker and is handed to exactly one callback on the
//! consuming side. The weekday is derived at creation time and carried
//! with the event so producer and consumer never disagree about it.

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// English weekday names, in the order accepted by filters.
pub const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// Visit timestamps grouped by origin key.
///
/// Order within a key reflects storage scan order unless a caller sorts it.
pub type VisitsByKey = BTreeMap<String, Vec<DateTime<Utc>>>;

/// Returns the English weekday name of a UTC timestamp.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use visitstream::event::weekday_name;
///
/// let t = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
/// assert_eq!(weekday_name(&t), "Wednesday");
/// ```
pub fn weekday_name(t: &DateTime<Utc>) -> &'static str {
    match t.weekday() {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// A single recorded visit.
///
/// The triple is immutable once created; use the accessors to read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitEvent {
    visited_at: DateTime<Utc>,
    origin_key: String,
    weekday: String,
}

impl VisitEvent {
    /// Creates an event for `origin_key` at `visited_at`, deriving the weekday.
    pub fn new(origin_key: impl Into<String>, visited_at: DateTime<Utc>) -> Self {
        Self {
            weekday: weekday_name(&visited_at).to_string(),
            visited_at,
            origin_key: origin_key.into(),
        }
    }

    /// Creates an event for `origin_key` stamped with the current UTC time.
    pub fn now(origin_key: impl Into<String>) -> Self {
        Self::new(origin_key, Utc::now())
    }

    pub fn visited_at(&self) -> DateTime<Utc> {
        self.visited_at
    }

    pub fn origin_key(&self) -> &str {
        &self.origin_key
    }

    pub fn weekday(&self) -> &str {
        &self.weekday
    }
}
