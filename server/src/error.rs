//! Error taxonomy of the synchronization core.
//!
//! Each enum maps to one failure domain and one recovery rule:
//! validation errors drop the request, store errors abort the current
//! operation, bus errors are either logged (publish) or fatal to the
//! propagation path (subscription), and transport errors evict one session.

use std::time::Duration;
use thiserror::Error;

pub use shared::ValidationError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("pixel ({x}, {y}) is outside the grid")]
    OutOfBounds { x: i64, y: i64 },

    #[error("color {0} is not a palette index")]
    InvalidColor(u8),

    #[error("grid store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("update bus unavailable: {0}")]
    Unavailable(String),

    #[error("update bus subscription terminated")]
    Disconnected,

    #[error("bus payload encoding failed: {0}")]
    Codec(String),
}

/// A send to one peer failed; the peer is considered unresponsive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("send deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("session limit of {0} reached")]
    Full(usize),
}

/// Why an inbound edit did not make it onto the bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EditError {
    #[error("rejected edit: {0}")]
    Validation(#[from] ValidationError),

    #[error("edit not stored: {0}")]
    Store(#[from] StoreError),

    /// The cell was written but the update was not published.
    #[error("edit stored but not published: {0}")]
    Publish(BusError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}
