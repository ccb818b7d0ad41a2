//! Belief type and proposal metadata

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vsm_core::{HlcTimestamp, VsmLevel};

/// Default belief time-to-live (one hour)
pub const DEFAULT_TTL_MS: u64 = 3_600_000;

/// Urgency above which a proposal rides the algedonic bypass
pub const URGENCY_BYPASS: f64 = 0.95;

/// Metadata attached to a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefMeta {
    /// Initial weight in `[0, 1]`
    pub weight: f64,
    /// Proposer confidence in `[0, 1]`
    pub confidence: f64,
    /// Urgency in `[0, 1]`; above [`URGENCY_BYPASS`] bypasses the hierarchy
    pub urgency: f64,
    /// Time-to-live in milliseconds
    pub ttl_ms: u64,
}

impl Default for BeliefMeta {
    fn default() -> Self {
        Self {
            weight: 0.5,
            confidence: 0.5,
            urgency: 0.0,
            ttl_ms: DEFAULT_TTL_MS,
        }
    }
}

impl BeliefMeta {
    /// Validate value ranges
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (name, v) in [
            ("weight", self.weight),
            ("confidence", self.confidence),
            ("urgency", self.urgency),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(format!("{} {} outside [0, 1]", name, v));
            }
        }
        if self.ttl_ms == 0 {
            return Err("ttl_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// A weighted, time-bounded assertion held at one VSM level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Belief {
    /// Unique id
    pub id: Uuid,
    /// Assertion text
    pub content: String,
    /// Level that proposed it
    pub source: VsmLevel,
    /// Current weight in `[0, 1]`
    pub weight: f64,
    /// Proposer confidence
    pub confidence: f64,
    /// Urgency at proposal time
    pub urgency: f64,
    /// Time-to-live from `timestamp`
    pub ttl_ms: u64,
    /// HLC stamp of the latest write
    pub timestamp: HlcTimestamp,
}

impl Belief {
    /// Build a belief from a proposal
    pub fn new(
        content: impl Into<String>,
        source: VsmLevel,
        meta: &BeliefMeta,
        timestamp: HlcTimestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            source,
            weight: meta.weight,
            confidence: meta.confidence,
            urgency: meta.urgency,
            ttl_ms: meta.ttl_ms,
            timestamp,
        }
    }

    /// Eviction score; lowest goes first when the level is over cap
    pub fn weighted_score(&self) -> f64 {
        self.weight * self.confidence
    }

    /// Whether the TTL has elapsed at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp.physical_ms) > self.ttl_ms
    }
}
