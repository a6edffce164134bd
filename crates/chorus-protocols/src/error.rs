//! Error types for chorus-protocols.

use thiserror::Error;

use crate::wire::{Tag, WireError};

/// Result type for chorus-protocols operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while handling or recording propagation traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// A control message was handed to the propagation engine.
    #[error("{0:?} is not a propagation message")]
    NotPropagation(Tag),

    /// Result export failed.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
