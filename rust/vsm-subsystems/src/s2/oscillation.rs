//! # Oscillation Detection and Dampening
//!
//! S2 watches the conflict log for repeated, regularly spaced conflicts
//! between the same pair of S1 units. A pair is oscillating when at least
//! three conflicts fall inside the 5 s window and their inter-arrival
//! intervals are regular (standard deviation under 20% of the mean).
//!
//! Each oscillation is summarized as `(frequency, amplitude, phase)`,
//! classified, and answered with a dampening strategy matched to its
//! class.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Conflict log capacity
pub const CONFLICT_RING: usize = 100;

/// Detection window
pub const DETECTION_WINDOW_MS: u64 = 5000;

/// Regularity bound: stddev of intervals under this fraction of the mean
pub const REGULARITY_LIMIT: f64 = 0.2;

/// One logged conflict between two units over a resource
#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    /// The conflicting pair, sorted so grouping is order-independent
    pub units: [String; 2],
    /// Contested resource
    pub resource: String,
    /// Wall-clock milliseconds of the conflict
    pub timestamp_ms: u64,
    /// Utilization of the contested resource at conflict time, in `[0, 1]`
    pub usage: f64,
}

impl ConflictRecord {
    /// Build a record with the unit pair sorted
    pub fn new(u1: &str, u2: &str, resource: &str, timestamp_ms: u64, usage: f64) -> Self {
        let mut units = [u1.to_string(), u2.to_string()];
        units.sort();
        Self {
            units,
            resource: resource.to_string(),
            timestamp_ms,
            usage,
        }
    }
}

/// Oscillation class, ordered from most to least aggressive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OscillationClass {
    /// Above 2 Hz with large amplitude
    HighFrequencyOscillation,
    /// Above 1 Hz with moderate amplitude
    Resonance,
    /// Above 0.5 Hz
    PeriodicConflict,
    /// Above 0.1 Hz
    SlowOscillation,
    /// Regular but very slow, or irregular repetition
    Sporadic,
}

impl OscillationClass {
    /// Canonical snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            OscillationClass::HighFrequencyOscillation => "high_frequency_oscillation",
            OscillationClass::Resonance => "resonance",
            OscillationClass::PeriodicConflict => "periodic_conflict",
            OscillationClass::SlowOscillation => "slow_oscillation",
            OscillationClass::Sporadic => "sporadic",
        }
    }
}

impl fmt::Display for OscillationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected oscillation between a unit pair
#[derive(Debug, Clone, Serialize)]
pub struct OscillationPattern {
    /// The oscillating pair, sorted
    pub units: [String; 2],
    /// Most contested resource in the group
    pub resource: String,
    /// Conflict frequency in Hz
    pub frequency_hz: f64,
    /// Amplitude derived from resource-usage level and spread (0..100)
    pub amplitude: f64,
    /// Phase of the first conflict within the period, in radians
    pub phase_rad: f64,
    /// Classification
    pub class: OscillationClass,
    /// Severity in `[0, 1]`
    pub severity: f64,
    /// Conflicts inside the window
    pub conflicts: usize,
}

/// Dampening strategy addressed to one unit
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DampeningCommand {
    /// Rotating time slots, one per unit
    TimeDivision {
        /// Slot width
        slot_ms: u64,
        /// This unit's slot
        slot_index: usize,
        /// Rotation modulus
        modulo: usize,
    },
    /// Per-unit phase offset with slight frequency detuning
    PhaseShift {
        /// Offset in radians (`i·2π/N`)
        offset_rad: f64,
        /// Fractional frequency detune
        detune: f64,
    },
    /// Single FIFO over the contested resource
    Serialization {
        /// Contested resource
        resource: String,
        /// Maximum hold per turn
        max_hold_ms: u64,
    },
    /// Cap the unit's request rate
    RateLimit {
        /// Maximum request rate (half the oscillation frequency)
        max_rate_hz: f64,
    },
    /// Flat multiplier on request rate for a bounded burst
    Multiplier {
        /// Rate multiplier
        factor: f64,
        /// How long it applies
        duration_ms: u64,
    },
}

/// Detect oscillations over the conflict log
pub fn detect<'a>(
    conflicts: impl Iterator<Item = &'a ConflictRecord>,
    now_ms: u64,
) -> Vec<OscillationPattern> {
    let window_start = now_ms.saturating_sub(DETECTION_WINDOW_MS);
    let mut groups: HashMap<[String; 2], Vec<&ConflictRecord>> = HashMap::new();
    for record in conflicts.filter(|c| c.timestamp_ms >= window_start) {
        groups.entry(record.units.clone()).or_default().push(record);
    }

    let mut patterns = Vec::new();
    for (units, mut group) in groups {
        if group.len() < 3 {
            continue;
        }
        group.sort_by_key(|c| c.timestamp_ms);

        let intervals: Vec<f64> = group
            .windows(2)
            .map(|w| (w[1].timestamp_ms - w[0].timestamp_ms) as f64)
            .collect();
        let mean_interval = intervals.iter().sum::<f64>() / intervals.len() as f64;
        if mean_interval <= 0.0 {
            continue;
        }
        let variance = intervals
            .iter()
            .map(|i| (i - mean_interval).powi(2))
            .sum::<f64>()
            / intervals.len() as f64;
        let regular = variance.sqrt() < REGULARITY_LIMIT * mean_interval;

        let frequency_hz = 1000.0 / mean_interval;
        let usage_mean = group.iter().map(|c| c.usage).sum::<f64>() / group.len() as f64;
        let usage_var = group
            .iter()
            .map(|c| (c.usage - usage_mean).powi(2))
            .sum::<f64>()
            / group.len() as f64;
        let amplitude = (usage_mean + usage_var.sqrt()) * 100.0;
        let phase_rad = {
            let period = mean_interval.max(1.0);
            let offset = (group[0].timestamp_ms as f64) % period;
            offset / period * std::f64::consts::TAU
        };

        let class = if !regular {
            OscillationClass::Sporadic
        } else {
            classify(frequency_hz, amplitude)
        };
        let severity =
            (frequency_hz * amplitude / 100.0 * (group.len() as f64 / 10.0).min(2.0)).min(1.0);

        let resource = dominant_resource(&group);
        patterns.push(OscillationPattern {
            units,
            resource,
            frequency_hz,
            amplitude,
            phase_rad,
            class,
            severity,
            conflicts: group.len(),
        });
    }

    patterns.sort_by(|a, b| b.severity.total_cmp(&a.severity));
    patterns
}

fn classify(frequency_hz: f64, amplitude: f64) -> OscillationClass {
    if frequency_hz > 2.0 && amplitude > 50.0 {
        OscillationClass::HighFrequencyOscillation
    } else if frequency_hz > 1.0 && amplitude > 30.0 {
        OscillationClass::Resonance
    } else if frequency_hz > 0.5 {
        OscillationClass::PeriodicConflict
    } else if frequency_hz > 0.1 {
        OscillationClass::SlowOscillation
    } else {
        OscillationClass::Sporadic
    }
}

fn dominant_resource(group: &[&ConflictRecord]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for record in group {
        *counts.entry(record.resource.as_str()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .map(|(r, _)| r.to_string())
        .unwrap_or_default()
}

/// Strategy for one unit of an oscillating pair
pub fn dampening_for(
    pattern: &OscillationPattern,
    unit_index: usize,
    total_units: usize,
) -> DampeningCommand {
    let n = total_units.max(1);
    match pattern.class {
        OscillationClass::HighFrequencyOscillation => DampeningCommand::TimeDivision {
            slot_ms: 100,
            slot_index: unit_index % n,
            modulo: n,
        },
        OscillationClass::Resonance => DampeningCommand::PhaseShift {
            offset_rad: unit_index as f64 * std::f64::consts::TAU / n as f64,
            detune: 0.02,
        },
        OscillationClass::PeriodicConflict => DampeningCommand::Serialization {
            resource: pattern.resource.clone(),
            max_hold_ms: 50,
        },
        OscillationClass::SlowOscillation => DampeningCommand::RateLimit {
            max_rate_hz: pattern.frequency_hz / 2.0,
        },
        OscillationClass::Sporadic => DampeningCommand::Multiplier {
            factor: 0.7,
            duration_ms: 1000,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflicts(times: &[u64], usage: f64) -> Vec<ConflictRecord> {
        times
            .iter()
            .map(|t| ConflictRecord::new("s1_1", "s1_2", "cpu", *t, usage))
            .collect()
    }

    #[test]
    fn test_regular_5hz_moderate_amplitude_is_resonance() {
        let records = conflicts(&[0, 200, 400], 0.4);
        let patterns = detect(records.iter(), 500);

        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert!((p.frequency_hz - 5.0).abs() < 1e-9);
        assert!((p.amplitude - 40.0).abs() < 1e-9);
        assert_eq!(p.class, OscillationClass::Resonance);
    }

    #[test]
    fn test_high_frequency_large_amplitude() {
        let records = conflicts(&[0, 100, 200, 300], 0.75);
        let patterns = detect(records.iter(), 350);
        assert_eq!(patterns[0].class, OscillationClass::HighFrequencyOscillation);
    }

    #[test]
    fn test_slow_regular_conflicts() {
        let records = conflicts(&[0, 4000, 8000], 0.4);
        let patterns = detect(records.iter(), 8100);
        // 8 s of spacing leaves only the last two in the 5 s window
        assert!(patterns.is_empty());

        let records = conflicts(&[0, 2000, 4000], 0.4);
        let patterns = detect(records.iter(), 4100);
        assert_eq!(patterns[0].class, OscillationClass::SlowOscillation);
    }

    #[test]
    fn test_irregular_conflicts_are_sporadic() {
        let records = conflicts(&[0, 150, 900], 0.4);
        let patterns = detect(records.iter(), 1000);
        assert_eq!(patterns[0].class, OscillationClass::Sporadic);
    }

    #[test]
    fn test_two_conflicts_are_not_an_oscillation() {
        let records = conflicts(&[0, 200], 0.4);
        assert!(detect(records.iter(), 300).is_empty());
    }

    #[test]
    fn test_phase_shift_offsets_split_the_pair() {
        let records = conflicts(&[0, 200, 400], 0.4);
        let patterns = detect(records.iter(), 500);
        let p = &patterns[0];

        let first = dampening_for(p, 0, 2);
        let second = dampening_for(p, 1, 2);
        match (first, second) {
            (
                DampeningCommand::PhaseShift { offset_rad: a, .. },
                DampeningCommand::PhaseShift { offset_rad: b, .. },
            ) => {
                assert!(a.abs() < 1e-9);
                assert!((b - std::f64::consts::PI).abs() < 1e-9);
            }
            other => panic!("expected phase shifts, got {:?}", other),
        }
    }

    #[test]
    fn test_severity_scales_with_frequency_and_count() {
        let fast = detect(conflicts(&[0, 100, 200, 300, 400], 0.6).iter(), 500);
        let slow = detect(conflicts(&[0, 2000, 4000], 0.3).iter(), 4100);
        assert!(fast[0].severity > slow[0].severity);
        assert!(fast[0].severity <= 1.0);
    }
}
