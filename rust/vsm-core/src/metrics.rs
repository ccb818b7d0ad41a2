//! # Metrics Registry - Counters, Gauges, and Tiered Samples
//!
//! Append-only counter/histogram store shared by every layer of the
//! runtime. Writers are single-writer-per-key by convention (each
//! subsystem owns its keys); cross-task reads are snapshot copies.
//!
//! Samples move through tiers: the hot tier is in-memory and keeps at most
//! five minutes, the warm tier is an on-disk sled tree pruned after 24
//! hours. The cold tier is an external replication target and not managed
//! here.

use crate::error::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Hot-tier retention (in memory)
pub const HOT_RETENTION_MS: u64 = 5 * 60 * 1000;

/// Warm-tier retention (on disk)
pub const WARM_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;

/// Hard bound on hot samples per key, independent of age
const MAX_HOT_SAMPLES: usize = 4096;

/// One timestamped observation
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Sample {
    /// Wall-clock milliseconds when observed
    pub at_ms: u64,
    /// Observed value
    pub value: f64,
}

/// Aggregate view over a key's hot samples
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HistogramSummary {
    /// Sample count
    pub count: usize,
    /// Arithmetic mean
    pub mean: f64,
    /// 95th percentile
    pub p95: f64,
    /// Maximum
    pub max: f64,
}

/// Point-in-time copy of every counter, gauge, and histogram
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    /// Monotonic counters
    pub counters: BTreeMap<String, u64>,
    /// Last-write-wins gauges
    pub gauges: BTreeMap<String, f64>,
    /// Histogram summaries over hot samples
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Counts reported by one rotation pass
#[derive(Debug, Clone, Copy, Default)]
pub struct RotationStats {
    /// Samples moved from hot to warm
    pub rotated: usize,
    /// Warm entries pruned past retention
    pub pruned: usize,
}

/// Process-wide metrics store
pub struct MetricsRegistry {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicU64>,
    hot: DashMap<String, Mutex<VecDeque<Sample>>>,
    warm: Option<sled::Db>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Create an in-memory registry (no warm tier)
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            hot: DashMap::new(),
            warm: None,
        }
    }

    /// Create a registry backed by an on-disk warm tier
    pub fn with_warm_tier(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            hot: DashMap::new(),
            warm: Some(db),
        })
    }

    /// Increment a counter by one
    pub fn incr(&self, key: &str) {
        self.add(key, 1);
    }

    /// Increment a counter by `n`
    pub fn add(&self, key: &str, n: u64) {
        self.counters
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Current counter value
    pub fn counter(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge
    pub fn set_gauge(&self, key: &str, value: f64) {
        self.gauges
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
    }

    /// Current gauge value
    pub fn gauge(&self, key: &str) -> Option<f64> {
        self.gauges
            .get(key)
            .map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
    }

    /// Record a timestamped sample into the hot tier
    pub fn observe(&self, key: &str, value: f64) {
        self.observe_at(key, value, crate::hlc::wall_ms());
    }

    /// Record a sample at an explicit wall-clock time
    pub fn observe_at(&self, key: &str, value: f64, at_ms: u64) {
        let ring = self
            .hot
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut ring = ring.lock();
        if ring.len() >= MAX_HOT_SAMPLES {
            ring.pop_front();
        }
        ring.push_back(Sample { at_ms, value });
    }

    /// The most recent `n` sample values for a key, oldest first
    pub fn recent(&self, key: &str, n: usize) -> Vec<f64> {
        self.hot
            .get(key)
            .map(|ring| {
                let ring = ring.lock();
                let skip = ring.len().saturating_sub(n);
                ring.iter().skip(skip).map(|s| s.value).collect()
            })
            .unwrap_or_default()
    }

    /// All hot samples at or after `since_ms`, oldest first
    pub fn samples_since(&self, key: &str, since_ms: u64) -> Vec<Sample> {
        self.hot
            .get(key)
            .map(|ring| {
                ring.lock()
                    .iter()
                    .filter(|s| s.at_ms >= since_ms)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Summary statistics over a key's hot samples
    pub fn histogram_summary(&self, key: &str) -> Option<HistogramSummary> {
        let ring = self.hot.get(key)?;
        let ring = ring.lock();
        if ring.is_empty() {
            return None;
        }

        let mut values: Vec<f64> = ring.iter().map(|s| s.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let p95_idx = ((count as f64 * 0.95).ceil() as usize).saturating_sub(1);
        Some(HistogramSummary {
            count,
            mean,
            p95: values[p95_idx.min(count - 1)],
            max: values[count - 1],
        })
    }

    /// Snapshot every counter, gauge, and histogram
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();
        for entry in self.counters.iter() {
            snapshot
                .counters
                .insert(entry.key().clone(), entry.value().load(Ordering::Relaxed));
        }
        for entry in self.gauges.iter() {
            snapshot.gauges.insert(
                entry.key().clone(),
                f64::from_bits(entry.value().load(Ordering::Relaxed)),
            );
        }
        for entry in self.hot.iter() {
            if let Some(summary) = self.histogram_summary(entry.key()) {
                snapshot.histograms.insert(entry.key().clone(), summary);
            }
        }
        snapshot
    }

    /// Rotate aged hot samples to the warm tier and prune expired warm rows
    ///
    /// Warm keys are time-prefixed (`{at_ms:020}/{metric}`) so pruning is a
    /// single range scan.
    pub fn rotate(&self) -> Result<RotationStats> {
        let now = crate::hlc::wall_ms();
        let hot_cutoff = now.saturating_sub(HOT_RETENTION_MS);
        let mut stats = RotationStats::default();

        for entry in self.hot.iter() {
            let mut ring = entry.value().lock();
            while let Some(front) = ring.front() {
                if front.at_ms >= hot_cutoff {
                    break;
                }
                let sample = ring.pop_front().unwrap_or(Sample {
                    at_ms: 0,
                    value: 0.0,
                });
                if let Some(db) = &self.warm {
                    let key = format!("{:020}/{}", sample.at_ms, entry.key());
                    db.insert(key.as_bytes(), &sample.value.to_le_bytes())?;
                }
                stats.rotated += 1;
            }
        }

        if let Some(db) = &self.warm {
            let warm_cutoff = now.saturating_sub(WARM_RETENTION_MS);
            let bound = format!("{:020}", warm_cutoff);
            let expired: Vec<_> = db
                .range(..bound.as_bytes())
                .keys()
                .collect::<std::result::Result<_, _>>()?;
            for key in expired {
                db.remove(key)?;
                stats.pruned += 1;
            }
            db.flush()?;
        }

        if stats.rotated > 0 || stats.pruned > 0 {
            debug!(
                rotated = stats.rotated,
                pruned = stats.pruned,
                "metric tier rotation"
            );
        }
        Ok(stats)
    }

    /// Number of rows currently in the warm tier
    pub fn warm_len(&self) -> usize {
        self.warm.as_ref().map(|db| db.len()).unwrap_or(0)
    }

    /// Spawn the background rotation task
    pub fn spawn_rotation(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = registry.rotate() {
                    warn!(error = %e, "metric rotation failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_gauges() {
        let metrics = MetricsRegistry::new();
        metrics.incr("requests");
        metrics.add("requests", 4);
        assert_eq!(metrics.counter("requests"), 5);
        assert_eq!(metrics.counter("missing"), 0);

        metrics.set_gauge("health", 0.75);
        assert_eq!(metrics.gauge("health"), Some(0.75));
    }

    #[test]
    fn test_histogram_summary() {
        let metrics = MetricsRegistry::new();
        for v in 1..=100 {
            metrics.observe("latency_ms", v as f64);
        }

        let summary = metrics.histogram_summary("latency_ms").unwrap();
        assert_eq!(summary.count, 100);
        assert!((summary.mean - 50.5).abs() < 1e-9);
        assert_eq!(summary.p95, 95.0);
        assert_eq!(summary.max, 100.0);
    }

    #[test]
    fn test_recent_returns_newest_window() {
        let metrics = MetricsRegistry::new();
        for v in 0..10 {
            metrics.observe("x", v as f64);
        }
        assert_eq!(metrics.recent("x", 3), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_rotation_moves_aged_samples_to_warm() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = MetricsRegistry::with_warm_tier(dir.path().join("warm")).unwrap();

        let now = crate::hlc::wall_ms();
        metrics.observe_at("old", 1.0, now - HOT_RETENTION_MS - 1000);
        metrics.observe_at("fresh", 2.0, now);

        let stats = metrics.rotate().unwrap();
        assert_eq!(stats.rotated, 1);
        assert_eq!(metrics.warm_len(), 1);
        assert_eq!(metrics.recent("old", 10).len(), 0);
        assert_eq!(metrics.recent("fresh", 10).len(), 1);
    }

    #[test]
    fn test_rotation_prunes_expired_warm_rows() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = MetricsRegistry::with_warm_tier(dir.path().join("warm")).unwrap();

        let now = crate::hlc::wall_ms();
        // Ages past warm retention after one rotation pass
        metrics.observe_at("ancient", 1.0, now - WARM_RETENTION_MS - 5000);
        metrics.rotate().unwrap();
        assert_eq!(metrics.warm_len(), 0);
    }
}
