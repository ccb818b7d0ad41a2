//! Pain/pleasure signal type

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vsm_core::HlcTimestamp;

/// Signal severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational (pleasure)
    Info,
    /// Pain below the agony band
    Warning,
    /// Agony or an emergency scream
    Critical,
}

/// Immutable algedonic signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Unique id
    pub id: Uuid,
    /// Emitting component or subsystem
    pub source: String,
    /// Metric (or reason) the signal was computed from
    pub metric: String,
    /// Intensity in `[0, 1]`
    pub intensity: f64,
    /// Severity band
    pub severity: Severity,
    /// HLC stamp; may be a fallback timestamp on the emergency path
    pub timestamp: HlcTimestamp,
}

impl Signal {
    /// Build a signal, clamping intensity into `[0, 1]`
    pub fn new(
        source: impl Into<String>,
        metric: impl Into<String>,
        intensity: f64,
        severity: Severity,
        timestamp: HlcTimestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            metric: metric.into(),
            intensity: intensity.clamp(0.0, 1.0),
            severity,
            timestamp,
        }
    }
}
