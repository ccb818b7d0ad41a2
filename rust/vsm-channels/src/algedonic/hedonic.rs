//! # Hedonic Adaptation Engine
//!
//! Each monitored metric carries a slowly moving baseline updated as
//! `baseline ← baseline + α·(current − baseline)`. Pain and agony
//! thresholds for response time shift with the baseline; error-rate
//! thresholds never adapt (errors are always bad), and the remaining
//! metrics keep fixed thresholds while their baselines feed pleasure
//! detection.
//!
//! Pain intensity is piecewise linear between the pain and agony
//! thresholds, capped at the agony intensity.

use std::collections::HashMap;

/// Metric key: request latency in milliseconds
pub const RESPONSE_TIME: &str = "response_time";
/// Metric key: error fraction in `[0, 1]`
pub const ERROR_RATE: &str = "error_rate";
/// Metric key: memory pressure fraction in `[0, 1]`
pub const MEMORY: &str = "memory";
/// Metric key: queued work items
pub const QUEUE_DEPTH: &str = "queue_depth";
/// Metric key: requests per second
pub const THROUGHPUT: &str = "throughput";
/// Metric key: cache hit fraction in `[0, 1]`
pub const CACHE_HIT_RATE: &str = "cache_hit_rate";

/// Neutral response-time baseline; no threshold shift at this value
const RESPONSE_TIME_NEUTRAL_MS: f64 = 50.0;

/// Pain/agony cut points in metric units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricThresholds {
    /// Value at which pain begins
    pub pain: f64,
    /// Value at which intensity saturates
    pub agony: f64,
}

/// Intensity bands and adaptation tuning
#[derive(Debug, Clone)]
pub struct HedonicConfig {
    /// Intensity emitted at the pain threshold
    pub pain_intensity: f64,
    /// Intensity cap reached at the agony threshold
    pub agony_intensity: f64,
    /// Intensity of pleasure signals
    pub pleasure_intensity: f64,
    /// Baseline smoothing factor α
    pub adaptation_rate: f64,
}

impl Default for HedonicConfig {
    fn default() -> Self {
        Self {
            pain_intensity: 0.85,
            agony_intensity: 0.95,
            pleasure_intensity: 0.90,
            adaptation_rate: 0.1,
        }
    }
}

/// Baseline store plus threshold arithmetic
#[derive(Debug)]
pub struct HedonicEngine {
    config: HedonicConfig,
    baselines: HashMap<String, f64>,
}

impl HedonicEngine {
    /// Create an engine with neutral baselines
    pub fn new(config: HedonicConfig) -> Self {
        let mut baselines = HashMap::new();
        baselines.insert(RESPONSE_TIME.to_string(), RESPONSE_TIME_NEUTRAL_MS);
        Self { config, baselines }
    }

    /// Engine configuration
    pub fn config(&self) -> &HedonicConfig {
        &self.config
    }

    /// Current baseline for a metric
    pub fn baseline(&self, metric: &str) -> Option<f64> {
        self.baselines.get(metric).copied()
    }

    /// Move one baseline toward the current value by α
    ///
    /// A metric seen for the first time starts at its current value.
    pub fn update_baseline(&mut self, metric: &str, current: f64) {
        let alpha = self.config.adaptation_rate;
        self.baselines
            .entry(metric.to_string())
            .and_modify(|b| *b += alpha * (current - *b))
            .or_insert(current);
    }

    /// Effective thresholds for a metric, after adaptation
    ///
    /// Response-time thresholds shift by `0.5·(baseline − 50 ms)`.
    /// Error-rate thresholds are never adapted.
    pub fn thresholds(&self, metric: &str) -> Option<MetricThresholds> {
        let mut thresholds = base_thresholds(metric)?;
        if metric == RESPONSE_TIME {
            let baseline = self
                .baseline(RESPONSE_TIME)
                .unwrap_or(RESPONSE_TIME_NEUTRAL_MS);
            let shift = 0.5 * (baseline - RESPONSE_TIME_NEUTRAL_MS);
            thresholds.pain += shift;
            thresholds.agony += shift;
        }
        Some(thresholds)
    }

    /// Pain intensity for a value, or `None` below the pain threshold
    pub fn pain_intensity(&self, metric: &str, value: f64) -> Option<f64> {
        let thresholds = self.thresholds(metric)?;
        if value < thresholds.pain {
            return None;
        }
        let span = (thresholds.agony - thresholds.pain).max(f64::EPSILON);
        let frac = ((value - thresholds.pain) / span).clamp(0.0, 1.0);
        let intensity = self.config.pain_intensity
            + frac * (self.config.agony_intensity - self.config.pain_intensity);
        Some(intensity)
    }

    /// Pleasure intensity for a value, or `None` when unremarkable
    ///
    /// Response time under 0.8x baseline, throughput over 1.2x baseline,
    /// or a cache-hit rate above 0.95.
    pub fn pleasure_intensity(&self, metric: &str, value: f64) -> Option<f64> {
        let pleased = match metric {
            RESPONSE_TIME => value < 0.8 * self.baseline(RESPONSE_TIME)?,
            THROUGHPUT => value > 1.2 * self.baseline(THROUGHPUT)?,
            CACHE_HIT_RATE => value > 0.95,
            _ => false,
        };
        pleased.then_some(self.config.pleasure_intensity)
    }
}

/// Fixed pain/agony cut points per metric
fn base_thresholds(metric: &str) -> Option<MetricThresholds> {
    match metric {
        RESPONSE_TIME => Some(MetricThresholds {
            pain: 500.0,
            agony: 2000.0,
        }),
        ERROR_RATE => Some(MetricThresholds {
            pain: 0.05,
            agony: 0.20,
        }),
        MEMORY => Some(MetricThresholds {
            pain: 0.80,
            agony: 0.95,
        }),
        QUEUE_DEPTH => Some(MetricThresholds {
            pain: 1000.0,
            agony: 5000.0,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> HedonicEngine {
        HedonicEngine::new(HedonicConfig::default())
    }

    #[test]
    fn test_response_time_boundaries() {
        let e = engine();
        // Exactly at the pain threshold
        assert_eq!(e.pain_intensity(RESPONSE_TIME, 500.0), Some(0.85));
        // At and beyond agony, capped
        let agony = e.pain_intensity(RESPONSE_TIME, 2000.0).unwrap();
        assert!((agony - 0.95).abs() < 1e-9);
        let beyond = e.pain_intensity(RESPONSE_TIME, 10_000.0).unwrap();
        assert!((beyond - 0.95).abs() < 1e-9);
        // Below threshold there is no pain
        assert_eq!(e.pain_intensity(RESPONSE_TIME, 499.9), None);
    }

    #[test]
    fn test_intensity_is_linear_between_thresholds() {
        let e = engine();
        let mid = e.pain_intensity(RESPONSE_TIME, 1250.0).unwrap();
        assert!((mid - 0.90).abs() < 1e-9);
    }

    #[test]
    fn test_response_time_thresholds_shift_with_baseline() {
        let mut e = engine();
        // Drive the baseline from 50 toward 1050 in one α=0.1 step: 150
        e.update_baseline(RESPONSE_TIME, 1050.0);
        assert!((e.baseline(RESPONSE_TIME).unwrap() - 150.0).abs() < 1e-9);

        let t = e.thresholds(RESPONSE_TIME).unwrap();
        assert!((t.pain - 550.0).abs() < 1e-9);
        assert!((t.agony - 2050.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_rate_thresholds_never_adapt() {
        let mut e = engine();
        // Baseline moves, thresholds must not
        for _ in 0..50 {
            e.update_baseline(ERROR_RATE, 0.5);
        }
        assert!(e.baseline(ERROR_RATE).unwrap() > 0.4);

        let t = e.thresholds(ERROR_RATE).unwrap();
        assert_eq!(t.pain, 0.05);
        assert_eq!(t.agony, 0.20);
        assert_eq!(e.pain_intensity(ERROR_RATE, 0.05), Some(0.85));
    }

    #[test]
    fn test_pleasure_conditions() {
        let mut e = engine();
        e.update_baseline(THROUGHPUT, 100.0);

        assert_eq!(e.pleasure_intensity(RESPONSE_TIME, 30.0), Some(0.90));
        assert_eq!(e.pleasure_intensity(RESPONSE_TIME, 45.0), None);
        assert_eq!(e.pleasure_intensity(THROUGHPUT, 130.0), Some(0.90));
        assert_eq!(e.pleasure_intensity(THROUGHPUT, 110.0), None);
        assert_eq!(e.pleasure_intensity(CACHE_HIT_RATE, 0.96), Some(0.90));
        assert_eq!(e.pleasure_intensity(CACHE_HIT_RATE, 0.90), None);
    }
}
