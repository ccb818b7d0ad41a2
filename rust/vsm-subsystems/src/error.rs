//! Error types shared by the five subsystems

use std::time::Duration;
use thiserror::Error;

/// Result type for subsystem operations
pub type Result<T> = std::result::Result<T, SubsystemError>;

/// Errors surfaced by subsystem operations
#[derive(Error, Debug)]
pub enum SubsystemError {
    /// Request or intervention exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A bounded queue rejected new work
    #[error("overflow: {0}")]
    Overflow(String),

    /// Rejected input parameters
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Named entity (unit, resource, handler) unknown
    #[error("not found: {0}")]
    NotFound(String),

    /// The subsystem is stopped or in emergency mode
    #[error("{subsystem} unavailable: {reason}")]
    Unavailable {
        /// Subsystem name
        subsystem: String,
        /// Why it refuses work
        reason: String,
    },

    /// A policy constraint blocked the decision
    #[error("constraint violation: {reasons:?}")]
    ConstraintViolation {
        /// Which constraints failed
        reasons: Vec<String>,
    },

    /// Resource pool could not satisfy a reservation
    #[error("resource {resource} exhausted ({requested} requested, {available} available)")]
    ResourceExhausted {
        /// Resource kind
        resource: String,
        /// Amount requested
        requested: f64,
        /// Amount still free
        available: f64,
    },

    /// Breaker, limiter, or pool rejection
    #[error(transparent)]
    Resilience(#[from] vsm_resilience::ResilienceError),

    /// Clock or bus failure
    #[error(transparent)]
    Core(#[from] vsm_core::CoreError),

    /// Variety channel failure
    #[error(transparent)]
    Channel(#[from] vsm_channels::ChannelError),
}
