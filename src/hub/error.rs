//! Hub error types
//!
//! Defines the errors that can cross the hub boundary. Per-connection
//! failures (`SendError`, `CodecError`) are recovered locally and never
//! reach a publisher.

use thiserror::Error;

/// Errors surfaced by the broadcast hub to its callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// A configured bound (inbound queue or registry) is full
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(&'static str),

    /// The hub has shut down and no longer accepts work
    #[error("Hub is closed")]
    Closed,
}

/// Failure to deliver a message to one connection handle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The underlying channel is gone or was closed
    #[error("Connection closed")]
    Closed,

    /// The message could not be encoded for the wire
    #[error("Encode failed: {0}")]
    Encode(String),

    /// The transport rejected the write
    #[error("Transport error: {0}")]
    Transport(String),

    /// The write did not complete within the send timeout
    #[error("Send timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

/// Message wire encode/decode failure
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Decode error: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl From<CodecError> for SendError {
    fn from(err: CodecError) -> Self {
        SendError::Encode(err.to_string())
    }
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;
