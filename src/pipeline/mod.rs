//! Consumption pipeline
//!
//! A [`ConsumptionLoop`] subscribes one broker handle to the visit topic,
//! decodes every message it polls and hands the event to an
//! [`EventHandler`]. Two loop flavours run side by side: auto-commit loops
//! that insert into the store, and a manual-commit loop that batches its
//! acknowledgements through [`commit::CommitCursor`].

pub mod commit;
pub mod consumer;
pub mod handlers;

use async_trait::async_trait;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::event::VisitEvent;

pub use commit::{CommitCursor, CommitPolicy, CommitReason, OffsetTracker};
pub use consumer::{CommitMode, ConsumptionLoop};
pub use handlers::{DayReporter, InsertVisitHandler};

/// Error type returned by callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked once per decoded event.
///
/// An `Err` is logged by the loop; it never stops consumption.
///
/// # Examples
///
/// ```
/// use visitstream::event::VisitEvent;
/// use visitstream::pipeline::{EventHandler, HandlerError};
///
/// struct Printer;
///
/// #[async_trait::async_trait]
/// impl EventHandler for Printer {
///     async fn handle(&self, event: VisitEvent) -> Result<(), HandlerError> {
///         println!("{} on {}", event.origin_key(), event.weekday());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: VisitEvent) -> Result<(), HandlerError>;
}

/// Lifecycle of one consumption loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Subscribing,
    Polling,
    Dispatching,
    Draining,
    Stopped,
}

/// Reasons a loop stops without being asked to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    /// The handle could not join the consumer group.
    #[error("Subscription failed: {0}")]
    Subscription(#[source] BrokerError),

    /// The broker connection became unusable.
    #[error("Fatal consumer error: {0}")]
    Fatal(#[source] BrokerError),
}

/// Counters reported when a loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    /// Events decoded and handed to the callback.
    pub dispatched: u64,
    /// Messages skipped because they could not be decoded.
    pub decode_failures: u64,
    /// Callback invocations that returned an error.
    pub handler_failures: u64,
    /// Successful offset commits.
    pub commits: u64,
    /// Offset commits the broker rejected.
    pub commit_failures: u64,
}
