//! Error types for the resilience layer

use std::time::Duration;
use thiserror::Error;

/// Result type for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Errors surfaced by breakers, limiters, and pools
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// The circuit is open; the wrapped call was not invoked
    #[error("circuit {name} is open")]
    CircuitOpen {
        /// Breaker name
        name: String,
    },

    /// The wrapped call exceeded its timeout
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// A token bucket had insufficient tokens
    #[error("rate limited on bucket {bucket}")]
    RateLimited {
        /// Bucket key that rejected the request
        bucket: String,
    },

    /// Pool is draining and rejects new checkouts
    #[error("pool {pool} is draining")]
    PoolDraining {
        /// Pool name
        pool: String,
    },

    /// Pool has no capacity left (permits exhausted or closed)
    #[error("pool {pool} exhausted")]
    PoolExhausted {
        /// Pool name
        pool: String,
    },

    /// Transport failure, classified for retry decisions
    #[error("transport error ({kind:?}): {message}")]
    Transport {
        /// Failure class
        kind: FailureKind,
        /// Underlying error text
        message: String,
    },

    /// Invalid construction parameters
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Classification of request failures
///
/// Only the first three classes are retried; server errors and unknown
/// failures surface immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Request exceeded its deadline
    Timeout,
    /// TCP connection refused
    ConnRefused,
    /// Connection dropped mid-request
    TransportClosed,
    /// HTTP 5xx from the upstream
    Http5xx,
    /// Anything else
    Other,
}

impl FailureKind {
    /// Whether this failure class is worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::ConnRefused | FailureKind::TransportClosed
        )
    }
}
