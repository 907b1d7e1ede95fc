//! Event codec for broker payloads
//!
//! Visit events travel through the broker as JSON documents. Encoding only
//! fails on values serde cannot represent; decoding fails on malformed or
//! truncated payloads.

use thiserror::Error;

use crate::event::VisitEvent;

/// Errors raised while converting events to and from broker payloads.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The event could not be serialized.
    #[error("Encoding error: {0}")]
    Encoding(#[source] serde_json::Error),

    /// The payload is not a valid encoded visit event.
    #[error("Decoding error: {0}")]
    Decoding(#[source] serde_json::Error),
}

/// Serializes an event into an opaque broker payload.
pub fn encode(event: &VisitEvent) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(event).map_err(CodecError::Encoding)
}

/// Parses a broker payload back into an event.
pub fn decode(payload: &[u8]) -> Result<VisitEvent, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::Decoding)
}
