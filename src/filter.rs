//! Query filter engine
//!
//! Validates the `gt`, `lt` and `day` query parameters and narrows a
//! [`VisitsByKey`] result set by time range and weekday. Parsing is the
//! only fallible step; once a [`VisitFilter`] exists, applying it is a
//! pure, total function.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::event::{weekday_name, VisitsByKey, WEEKDAY_NAMES};

/// Query key for the lower bound.
pub const GREATER_THAN_KEY: &str = "gt";
/// Query key for the upper bound.
pub const LESS_THAN_KEY: &str = "lt";
/// Query key for the weekday.
pub const WEEKDAY_KEY: &str = "day";

/// Errors raised while validating filter parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
}

/// Parses the partial date stored under `key`.
///
/// Accepts `YYYY`, `YYYY-MM` or `YYYY-MM-DD`; missing components default
/// to `01` and the result is midnight UTC of that day. A missing key is
/// not an error and yields `None`.
///
/// # Errors
///
/// Returns `FilterError::InvalidFilter` if the value is not a valid
/// partial date.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use chrono::{TimeZone, Utc};
/// use visitstream::filter::parse_bound;
///
/// let mut query = HashMap::new();
/// query.insert("gt".to_string(), "2020-05".to_string());
///
/// let bound = parse_bound(&query, "gt").unwrap();
/// assert_eq!(bound, Some(Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).unwrap()));
/// assert_eq!(parse_bound(&query, "lt").unwrap(), None);
/// ```
pub fn parse_bound(
    query: &HashMap<String, String>,
    key: &str,
) -> Result<Option<DateTime<Utc>>, FilterError> {
    let Some(value) = query.get(key) else {
        return Ok(None);
    };

    let invalid = || FilterError::InvalidFilter(format!("{}={:?} is not a date", key, value));

    let parts: Vec<&str> = value.split('-').collect();
    let widths = [4, 2, 2];
    if parts.len() > widths.len()
        || parts
            .iter()
            .zip(widths)
            .any(|(part, width)| part.len() != width || !part.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(invalid());
    }

    let padded = match parts.as_slice() {
        [year] => format!("{}-01-01", year),
        [year, month] => format!("{}-{}-01", year, month),
        _ => value.clone(),
    };

    let date = NaiveDate::parse_from_str(&padded, "%Y-%m-%d").map_err(|_| invalid())?;
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
    Ok(Some(midnight.and_utc()))
}

/// Checks the weekday stored under `day`.
///
/// The value must match one of [`WEEKDAY_NAMES`] exactly (case-sensitive).
///
/// # Errors
///
/// Returns `FilterError::InvalidFilter` for any other value.
pub fn validate_weekday(query: &HashMap<String, String>) -> Result<Option<String>, FilterError> {
    match query.get(WEEKDAY_KEY) {
        None => Ok(None),
        Some(day) if WEEKDAY_NAMES.contains(&day.as_str()) => Ok(Some(day.clone())),
        Some(day) => Err(FilterError::InvalidFilter(format!(
            "{}={:?} is not a weekday name",
            WEEKDAY_KEY, day
        ))),
    }
}

/// Keeps only the timestamps that satisfy every given bound.
///
/// Bounds are inclusive. A key left with no timestamps is removed from the
/// result rather than kept with an empty list.
pub fn apply_filter(
    visits: VisitsByKey,
    gt: Option<DateTime<Utc>>,
    lt: Option<DateTime<Utc>>,
    weekday: Option<&str>,
) -> VisitsByKey {
    let filter = VisitFilter {
        gt,
        lt,
        weekday: weekday.map(str::to_string),
    };
    filter.apply(visits)
}

/// A validated set of filter bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitFilter {
    pub gt: Option<DateTime<Utc>>,
    pub lt: Option<DateTime<Utc>>,
    pub weekday: Option<String>,
}

impl VisitFilter {
    /// Validates every filter parameter in `query`.
    ///
    /// Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns the first `FilterError::InvalidFilter` encountered, checking
    /// `gt`, then `lt`, then `day`.
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self, FilterError> {
        Ok(Self {
            gt: parse_bound(query, GREATER_THAN_KEY)?,
            lt: parse_bound(query, LESS_THAN_KEY)?,
            weekday: validate_weekday(query)?,
        })
    }

    /// Returns true if no bound is set.
    pub fn is_empty(&self) -> bool {
        self.gt.is_none() && self.lt.is_none() && self.weekday.is_none()
    }

    /// Returns true if `t` satisfies every bound.
    pub fn matches(&self, t: &DateTime<Utc>) -> bool {
        if let Some(gt) = &self.gt {
            if t < gt {
                return false;
            }
        }

        if let Some(lt) = &self.lt {
            if t > lt {
                return false;
            }
        }

        match &self.weekday {
            Some(day) => weekday_name(t) == day,
            None => true,
        }
    }

    /// Narrows `visits` to the matching timestamps, dropping emptied keys.
    pub fn apply(&self, visits: VisitsByKey) -> VisitsByKey {
        visits
            .into_iter()
            .filter_map(|(key, times)| {
                let kept: Vec<_> = times.into_iter().filter(|t| self.matches(t)).collect();
                (!kept.is_empty()).then_some((key, kept))
            })
            .collect()
    }

    /// Human-readable description used in log lines.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "none".to_string();
        }

        let mut parts = Vec::new();
        if let Some(gt) = &self.gt {
            parts.push(format!("gt={}", gt.format("%Y-%m-%d")));
        }
        if let Some(lt) = &self.lt {
            parts.push(format!("lt={}", lt.format("%Y-%m-%d")));
        }
        if let Some(day) = &self.weekday {
            parts.push(format!("day={}", day));
        }

        parts.join(" ")
    }
}
