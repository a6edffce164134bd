//! Error types for chorus-node.

use chorus_protocols::{ProtocolError, WireError};
use chorus_topology::TopologyError;
use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors that can occur in a peer or registry process.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Overlay construction, lookup, or file error
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Propagation or result export error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Undecodable frame
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// A frame longer than the transport accepts
    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    /// Malformed device-count string
    #[error("Invalid device string: {0}")]
    InvalidDevices(String),

    /// Bad environment variable or argument
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown or malformed operator command
    #[error("Command error: {0}")]
    Command(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
