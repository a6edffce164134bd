//! Error types for chorus-topology.

use thiserror::Error;

/// Result type for topology operations.
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Errors raised while building, checking, or (re)importing an overlay.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The requested degree band cannot be satisfied for this peer count.
    #[error("invalid topology request: {0}")]
    InvalidTopologyRequest(String),

    /// Randomized construction never produced a graph inside the degree band.
    #[error("overlay construction failed after {attempts} attempts")]
    ConstructionFailed { attempts: usize },

    /// A finished graph has a vertex outside the degree band.
    #[error("vertex {vertex} has degree {degree}, expected {min}..={max}")]
    DegreeViolation {
        vertex: usize,
        degree: usize,
        min: usize,
        max: usize,
    },

    /// Attempted to join two vertices that already share an edge.
    #[error("vertices {0} and {1} are already connected")]
    AlreadyConnected(usize, usize),

    /// Attempted to join a vertex to itself.
    #[error("vertex {0} cannot connect to itself")]
    SelfLoop(usize),

    /// Lookup of an identity that has no vertex in this map.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Retargeting onto a peer list of the wrong size.
    #[error("overlay requires {expected} peers, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// An identity key that is not `host:port`.
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    /// A malformed row or header in an exported overlay.
    #[error("malformed overlay file at line {line}: {reason}")]
    Malformed { line: u64, reason: String },

    /// CSV reader or writer failure.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
