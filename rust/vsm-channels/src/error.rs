//! Error types for channels

use thiserror::Error;

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors surfaced by variety and algedonic channels
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Channel was closed while a receive was pending
    #[error("channel {0} closed")]
    Closed(String),

    /// Invalid construction parameters
    #[error("invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// Bus error while announcing channel state
    #[error(transparent)]
    Core(#[from] vsm_core::CoreError),
}
