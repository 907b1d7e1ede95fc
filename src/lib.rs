//! Visitstream - visit event pipeline library
//!
//! Visits are published as events on a Kafka topic, consumed by several
//! consumer groups, persisted in a local SQLite store and served back
//! through a filtered HTTP query API.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `event`: The visit event and its weekday derivation
//! - `codec`: Wire encoding of events
//! - `broker`: Broker abstraction with Kafka and in-memory implementations
//! - `publisher`: Keyed publishing of visit events
//! - `pipeline`: Consumption loops, commit policy and event handlers
//! - `storage`: The visit store
//! - `filter`: Date-range and weekday filtering of visit histories
//! - `service`, `http`: Query façade and the HTTP API on top of it
//! - `app`: Supervisor wiring everything to one cancellation token
//! - `config`, `logging`, `cli`, `commands`, `error`: Process plumbing
//!
//! # Example
//!
//! ```no_run
//! use visitstream::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/visitstream.yaml", &Default::default())?;
//!     config.validate()?;
//!     visitstream::commands::serve::run_serve(config, true).await
//! }
//! ```

pub mod app;
pub mod broker;
pub mod cli;
pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod http;
pub mod logging;
pub mod pipeline;
pub mod publisher;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, VisitstreamError};
pub use event::{VisitEvent, VisitsByKey};

#[cfg(test)]
pub mod test_utils;
