//! # VSM Core - Clock, Bus, and Metrics
//!
//! Foundation services for the viable-system runtime:
//!
//! - [`hlc`]: the process-wide hybrid logical clock that totally orders
//!   every event the runtime produces
//! - [`bus`]: topic-keyed pub/sub with bounded subscriber queues and
//!   drop-oldest backpressure
//! - [`metrics`]: the append-only counter/histogram store with hot/warm
//!   tier rotation
//!
//! The clock and the bus are the only legitimate process-wide singletons;
//! they are created before any subsystem and handed down as `Arc`s. No
//! other module holds process-wide mutable state.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod error;
pub mod event;
pub mod hlc;
pub mod metrics;

pub use bus::{EventBus, Subscription, TopicStats};
pub use error::{CoreError, Result};
pub use event::{topics, Event};
pub use hlc::{HlcTimestamp, HybridLogicalClock};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The five control levels of the viable system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VsmLevel {
    /// Operations
    S1,
    /// Coordination
    S2,
    /// Control
    S3,
    /// Intelligence
    S4,
    /// Policy
    S5,
}

impl VsmLevel {
    /// All levels, bottom up
    pub const ALL: [VsmLevel; 5] = [
        VsmLevel::S1,
        VsmLevel::S2,
        VsmLevel::S3,
        VsmLevel::S4,
        VsmLevel::S5,
    ];

    /// Canonical lowercase name (`s1`..`s5`)
    pub fn as_str(&self) -> &'static str {
        match self {
            VsmLevel::S1 => "s1",
            VsmLevel::S2 => "s2",
            VsmLevel::S3 => "s3",
            VsmLevel::S4 => "s4",
            VsmLevel::S5 => "s5",
        }
    }

    /// Health topic for this level (`s1_health`..`s5_health`)
    pub fn health_topic(&self) -> &'static str {
        match self {
            VsmLevel::S1 => topics::S1_HEALTH,
            VsmLevel::S2 => topics::S2_HEALTH,
            VsmLevel::S3 => topics::S3_HEALTH,
            VsmLevel::S4 => topics::S4_HEALTH,
            VsmLevel::S5 => topics::S5_HEALTH,
        }
    }
}

impl fmt::Display for VsmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VsmLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s1" => Ok(VsmLevel::S1),
            "s2" => Ok(VsmLevel::S2),
            "s3" => Ok(VsmLevel::S3),
            "s4" => Ok(VsmLevel::S4),
            "s5" => Ok(VsmLevel::S5),
            other => Err(CoreError::InvalidTopic(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_round_trip() {
        for level in VsmLevel::ALL {
            assert_eq!(level.as_str().parse::<VsmLevel>().unwrap(), level);
        }
        assert!("s9".parse::<VsmLevel>().is_err());
    }
}
