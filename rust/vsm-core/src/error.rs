//! Error types for the core services

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in the clock, bus, and metrics services
#[derive(Error, Debug)]
pub enum CoreError {
    /// The HLC lock could not be acquired within the bounded retry budget
    #[error("hybrid logical clock unavailable after {attempts} attempts")]
    HlcUnavailable {
        /// Number of acquisition attempts made
        attempts: u32,
    },

    /// Topic name was empty or otherwise malformed
    #[error("invalid topic: {0:?}")]
    InvalidTopic(String),

    /// Subscriber exceeded the consecutive delivery-error budget and was removed
    #[error("subscriber {subscriber_id} unreachable after {errors} consecutive errors")]
    SubscriberUnreachable {
        /// Identifier of the removed subscriber
        subscriber_id: uuid::Uuid,
        /// Consecutive delivery errors observed
        errors: u32,
    },

    /// A bounded bus queue overflowed and dropped its oldest event
    #[error("bus overflow on topic {topic}: {dropped} events dropped")]
    BusOverflow {
        /// Topic whose subscriber queue overflowed
        topic: String,
        /// Total events dropped for that subscriber
        dropped: u64,
    },

    /// Warm-tier storage error
    #[error("metrics storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sled::Error> for CoreError {
    fn from(e: sled::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}
