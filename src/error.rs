//! Error types for Visitstream
//!
//! This module defines the crate-wide error type used at the application
//! boundary, using `thiserror` for ergonomic error handling. Components
//! keep their own narrower error enums (`CodecError`, `PublishError`,
//! `ConsumeError`, `StoreError`, `FilterError`) next to the code that
//! raises them.

use thiserror::Error;

/// Main error type for Visitstream application-level operations
///
/// Covers configuration loading, startup wiring, and the few places where
/// component errors are lifted into a single type.
#[derive(Error, Debug)]
pub enum VisitstreamError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker connection or client creation errors during startup
    #[error("Broker error: {0}")]
    Broker(String),

    /// HTTP listener errors (bind or serve failures)
    #[error("HTTP listener error: {0}")]
    Listener(String),

    /// Visit store errors surfaced to the application boundary
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for Visitstream operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
