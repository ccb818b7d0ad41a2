//! Error types for belief consensus

use thiserror::Error;

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors surfaced by belief stores and delta sync
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// Belief id unknown at this level
    #[error("belief {0} not found")]
    NotFound(uuid::Uuid),

    /// Rejected proposal or vote parameters
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Vote discarded because the node is quarantined
    #[error("node {node} is quarantined")]
    ByzantineQuarantined {
        /// Offending node
        node: String,
    },

    /// Peer transport failure during delta sync
    #[error("transport error to {peer}: {message}")]
    Transport {
        /// Peer that could not be reached
        peer: String,
        /// Underlying error text
        message: String,
    },

    /// Delta log persistence error
    #[error("delta log storage error: {0}")]
    Storage(String),

    /// Wire encoding error
    #[error("delta encoding error: {0}")]
    Encoding(String),

    /// Clock or bus failure
    #[error(transparent)]
    Core(#[from] vsm_core::CoreError),
}

impl From<sled::Error> for ConsensusError {
    fn from(e: sled::Error) -> Self {
        ConsensusError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for ConsensusError {
    fn from(e: bincode::Error) -> Self {
        ConsensusError::Encoding(e.to_string())
    }
}
