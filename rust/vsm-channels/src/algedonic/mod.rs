//! # Algedonic Channel - Priority Bypass
//!
//! Computes pain and pleasure from real telemetry and bypasses the whole
//! hierarchy when severity is critical. Telemetry arrives by subscription
//! (health events, latencies, error rates, memory pressure, queue depths,
//! cache rates); assessment runs on a 1 s tick over the most recent 100
//! samples per metric, and hedonic adaptation moves baselines every 60 s.
//!
//! `emergency_scream` must succeed even when the HLC is unavailable: it
//! stamps a fallback timestamp and publishes through the critical bus
//! path. Three critical signals inside one minute escalate to a
//! `system_shutdown` broadcast.

pub mod hedonic;
pub mod signal;

pub use hedonic::{HedonicConfig, HedonicEngine, MetricThresholds};
pub use signal::{Severity, Signal};

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use vsm_core::{topics, Event, EventBus, HybridLogicalClock};

/// Retained signal history
const SIGNAL_RING: usize = 100;

/// Rolling aggregate window per metric
const SAMPLE_WINDOW: usize = 100;

/// Algedonic tuning knobs
#[derive(Debug, Clone)]
pub struct AlgedonicConfig {
    /// Intensity bands and adaptation rate
    pub hedonic: HedonicConfig,
    /// Assessment tick period
    pub assess_interval: Duration,
    /// Baseline adaptation period
    pub adaptation_interval: Duration,
    /// Window for counting critical signals
    pub critical_window: Duration,
    /// Critical signals within the window that force shutdown
    pub critical_limit: usize,
    /// Health silence after which a subsystem is treated as dead
    pub stale_after: Duration,
    /// Identical screams inside this window are coalesced
    pub coalesce_window: Duration,
}

impl Default for AlgedonicConfig {
    fn default() -> Self {
        Self {
            hedonic: HedonicConfig::default(),
            assess_interval: Duration::from_secs(1),
            adaptation_interval: Duration::from_secs(60),
            critical_window: Duration::from_secs(60),
            critical_limit: 3,
            stale_after: Duration::from_secs(5),
            coalesce_window: Duration::from_millis(100),
        }
    }
}

/// Channel state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgedonicState {
    /// Nothing hurts
    Neutral,
    /// Pain-band signals active
    Pain,
    /// Agony-band signals active
    Agony,
    /// An emergency scream is in effect
    EmergencyActive,
}

#[derive(Debug, Default)]
struct SampleWindow {
    ring: VecDeque<f64>,
    fresh: usize,
}

impl SampleWindow {
    fn push(&mut self, value: f64) {
        if self.ring.len() >= SAMPLE_WINDOW {
            self.ring.pop_front();
        }
        self.ring.push_back(value);
        self.fresh += 1;
    }

    fn mean(&self) -> Option<f64> {
        if self.ring.is_empty() {
            return None;
        }
        Some(self.ring.iter().sum::<f64>() / self.ring.len() as f64)
    }
}

/// The cross-cutting pain/pleasure bypass
pub struct AlgedonicChannel {
    bus: Arc<EventBus>,
    clock: Arc<HybridLogicalClock>,
    config: AlgedonicConfig,
    engine: Mutex<HedonicEngine>,
    samples: Mutex<HashMap<String, SampleWindow>>,
    signals: Mutex<VecDeque<Signal>>,
    state: Mutex<AlgedonicState>,
    intervention_active: AtomicBool,
    critical_times: Mutex<VecDeque<Instant>>,
    recent_screams: Mutex<HashMap<(String, String), Instant>>,
    stale_screamed: Mutex<HashSet<String>>,
    subsystem_health: Mutex<HashMap<String, (f64, Instant)>>,
}

impl AlgedonicChannel {
    /// Create the channel
    pub fn new(
        bus: Arc<EventBus>,
        clock: Arc<HybridLogicalClock>,
        config: AlgedonicConfig,
    ) -> Self {
        Self {
            engine: Mutex::new(HedonicEngine::new(config.hedonic.clone())),
            bus,
            clock,
            config,
            samples: Mutex::new(HashMap::new()),
            signals: Mutex::new(VecDeque::new()),
            state: Mutex::new(AlgedonicState::Neutral),
            intervention_active: AtomicBool::new(false),
            critical_times: Mutex::new(VecDeque::new()),
            recent_screams: Mutex::new(HashMap::new()),
            stale_screamed: Mutex::new(HashSet::new()),
            subsystem_health: Mutex::new(HashMap::new()),
        }
    }

    /// Current state-machine position
    pub fn state(&self) -> AlgedonicState {
        *self.state.lock()
    }

    /// Whether a pain-driven intervention is currently flagged
    pub fn intervention_active(&self) -> bool {
        self.intervention_active.load(Ordering::Acquire)
    }

    /// Recent signal history (bounded ring)
    pub fn history(&self) -> Vec<Signal> {
        self.signals.lock().iter().cloned().collect()
    }

    /// Last known health per subsystem
    pub fn subsystem_health(&self) -> HashMap<String, f64> {
        self.subsystem_health
            .lock()
            .iter()
            .map(|(k, (h, _))| (k.clone(), *h))
            .collect()
    }

    /// Record one telemetry sample
    pub fn record_sample(&self, metric: &str, value: f64) {
        self.samples
            .lock()
            .entry(metric.to_string())
            .or_default()
            .push(value);
    }

    /// Ingest one bus event: health bookkeeping plus telemetry extraction
    pub fn ingest(&self, event: &Event) {
        if let Some(level) = event.event_type.strip_suffix("_health") {
            if let Some(health) = event.data.get("health").and_then(|v| v.as_f64()) {
                self.subsystem_health
                    .lock()
                    .insert(level.to_string(), (health, Instant::now()));
                self.stale_screamed.lock().remove(level);
            }
        }

        match event.event_type.as_str() {
            topics::CHANNEL_OVERFLOW => {
                let intensity = event
                    .data
                    .get("intensity")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.5);
                let channel = event
                    .data
                    .get("channel")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                self.emit_pain(
                    "variety_channel",
                    &format!("channel_overflow:{}", channel),
                    intensity,
                );
            }
            "optimization_applied" => {
                self.emit_pleasure("optimizer", "optimization", self.config.hedonic.pleasure_intensity);
            }
            _ => {}
        }

        let mappings: [(&str, &str); 6] = [
            ("response_time_ms", hedonic::RESPONSE_TIME),
            ("error_rate", hedonic::ERROR_RATE),
            ("memory_pressure", hedonic::MEMORY),
            ("queue_depth", hedonic::QUEUE_DEPTH),
            ("throughput", hedonic::THROUGHPUT),
            ("cache_hit_rate", hedonic::CACHE_HIT_RATE),
        ];
        for (key, metric) in mappings {
            if let Some(value) = event.data.get(key).and_then(|v| v.as_f64()) {
                self.record_sample(metric, value);
            }
        }
    }

    /// One assessment pass over metrics with fresh samples
    ///
    /// Windows without new samples since the previous pass are skipped, so
    /// a signal is never recomputed from already-counted telemetry.
    pub fn assess(&self) {
        let mut pains: Vec<(String, f64)> = Vec::new();
        let mut pleasures: Vec<(String, f64)> = Vec::new();
        {
            let engine = self.engine.lock();
            let mut samples = self.samples.lock();
            for (metric, window) in samples.iter_mut() {
                if window.fresh == 0 {
                    continue;
                }
                window.fresh = 0;
                let Some(mean) = window.mean() else { continue };

                if let Some(intensity) = engine.pain_intensity(metric, mean) {
                    pains.push((metric.clone(), intensity));
                } else if let Some(intensity) = engine.pleasure_intensity(metric, mean) {
                    pleasures.push((metric.clone(), intensity));
                }
            }
        }

        for (metric, intensity) in &pains {
            self.emit_pain("algedonic", metric, *intensity);
        }
        for (metric, intensity) in &pleasures {
            self.emit_pleasure("algedonic", metric, *intensity);
        }

        // Dead-subsystem sweep rides the same tick
        self.detect_dead_subsystems();

        // State machine: pain escalates, silence relaxes
        let agony = self.config.hedonic.agony_intensity;
        let mut state = self.state.lock();
        if *state != AlgedonicState::EmergencyActive {
            *state = if pains.iter().any(|(_, i)| *i >= agony) {
                AlgedonicState::Agony
            } else if !pains.is_empty() {
                AlgedonicState::Pain
            } else {
                AlgedonicState::Neutral
            };
        }
    }

    /// One baseline-adaptation pass over current window means
    pub fn adapt(&self) {
        // Lock order matches assess(): engine before samples
        let mut engine = self.engine.lock();
        let samples = self.samples.lock();
        for (metric, window) in samples.iter() {
            if let Some(mean) = window.mean() {
                engine.update_baseline(metric, mean);
            }
        }
        debug!("hedonic baselines adapted");
    }

    /// Effective thresholds, post-adaptation (read-only view for callers)
    pub fn thresholds(&self, metric: &str) -> Option<MetricThresholds> {
        self.engine.lock().thresholds(metric)
    }

    /// Critical bypass: publish pain at intensity 1.0 past every layer
    ///
    /// Never fails: a contended HLC yields a fallback timestamp, and
    /// publishing uses the bus's critical path. Identical screams within
    /// the coalescing window collapse into one.
    #[instrument(skip(self))]
    pub fn emergency_scream(&self, source: &str, reason: &str) {
        let key = (source.to_string(), reason.to_string());
        {
            let mut recent = self.recent_screams.lock();
            let now = Instant::now();
            if let Some(at) = recent.get(&key) {
                if now.duration_since(*at) < self.config.coalesce_window {
                    return;
                }
            }
            recent.insert(key, now);
        }

        error!(source, reason, "EMERGENCY SCREAM");
        let timestamp = self.clock.tick_or_fallback();
        let signal = Signal::new(source, reason, 1.0, Severity::Critical, timestamp);
        self.remember(signal.clone());
        *self.state.lock() = AlgedonicState::EmergencyActive;

        let payload = serde_json::to_value(&signal).unwrap_or_default();
        let _ = self
            .bus
            .publish_critical(topics::EMERGENCY_ALGEDONIC, "algedonic", payload.clone());
        let _ = self
            .bus
            .publish_critical(topics::S5_EMERGENCY_OVERRIDE, "algedonic", payload);
        let _ = self.bus.publish_critical(
            topics::ALL_SUBSYSTEMS,
            "algedonic",
            serde_json::json!({
                "emergency_mode": true,
                "source": source,
                "reason": reason,
            }),
        );
        self.bus.metrics().incr("algedonic.screams");
        self.note_critical();
    }

    fn emit_pain(&self, source: &str, metric: &str, intensity: f64) {
        let agony = self.config.hedonic.agony_intensity;
        let severity = if intensity >= agony {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let signal = Signal::new(
            source,
            metric,
            intensity,
            severity,
            self.clock.tick_or_fallback(),
        );
        self.remember(signal.clone());
        self.intervention_active.store(true, Ordering::Release);

        let payload = serde_json::to_value(&signal).unwrap_or_default();
        let _ = self
            .bus
            .publish_critical(topics::ALGEDONIC_PAIN, "algedonic", payload.clone());
        let _ = self.bus.publish_critical(
            topics::S3_INTERVENTION_REQUIRED,
            "algedonic",
            payload,
        );
        self.bus.metrics().incr("algedonic.pain");
        warn!(metric, intensity, "pain signal");

        if severity == Severity::Critical {
            self.note_critical();
        }
    }

    fn emit_pleasure(&self, source: &str, metric: &str, intensity: f64) {
        let signal = Signal::new(
            source,
            metric,
            intensity,
            Severity::Info,
            self.clock.tick_or_fallback(),
        );
        self.remember(signal.clone());

        let payload = serde_json::to_value(&signal).unwrap_or_default();
        let _ = self
            .bus
            .publish_critical(topics::ALGEDONIC_PLEASURE, "algedonic", payload);
        self.bus.metrics().incr("algedonic.pleasure");
        debug!(metric, intensity, "pleasure signal");

        // Pleasure clears the active intervention flag
        self.intervention_active.store(false, Ordering::Release);
    }

    fn remember(&self, signal: Signal) {
        let mut signals = self.signals.lock();
        if signals.len() >= SIGNAL_RING {
            signals.pop_front();
        }
        signals.push_back(signal);
    }

    fn note_critical(&self) {
        let mut times = self.critical_times.lock();
        let now = Instant::now();
        times.push_back(now);
        while let Some(front) = times.front() {
            if now.duration_since(*front) > self.config.critical_window {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() >= self.config.critical_limit {
            times.clear();
            drop(times);
            error!("critical signal overload, requesting system shutdown");
            let _ = self.bus.publish_critical(
                topics::SYSTEM_SHUTDOWN,
                "algedonic",
                serde_json::json!({ "reason": "algedonic_overload" }),
            );
        }
    }

    fn detect_dead_subsystems(&self) {
        let stale: Vec<String> = {
            let health = self.subsystem_health.lock();
            let mut screamed = self.stale_screamed.lock();
            let names: Vec<String> = health
                .iter()
                .filter(|(name, (_, at))| {
                    at.elapsed() >= self.config.stale_after && !screamed.contains(*name)
                })
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                screamed.insert(name.clone());
            }
            names
        };

        for name in stale {
            self.emergency_scream(&name, "subsystem health stale");
        }
    }

    /// Run the channel: ingest telemetry, assess each second, adapt each
    /// minute, until the shutdown signal flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut sub = match self.bus.subscribe(topics::ALL) {
            Ok(sub) => sub,
            Err(e) => {
                error!(error = %e, "algedonic channel failed to subscribe");
                return;
            }
        };
        let mut assess_tick = tokio::time::interval(self.config.assess_interval);
        assess_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut adapt_tick = tokio::time::interval(self.config.adaptation_interval);
        adapt_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("algedonic channel running");
        loop {
            tokio::select! {
                event = sub.recv() => {
                    match event {
                        Some(event) => self.ingest(&event),
                        None => break,
                    }
                }
                _ = assess_tick.tick() => self.assess(),
                _ = adapt_tick.tick() => self.adapt(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("algedonic channel stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsm_core::MetricsRegistry;

    fn channel() -> (Arc<AlgedonicChannel>, Arc<EventBus>) {
        let clock = Arc::new(HybridLogicalClock::new("algedonic-test"));
        let bus = Arc::new(EventBus::new(clock.clone(), Arc::new(MetricsRegistry::new())));
        let chan = Arc::new(AlgedonicChannel::new(
            Arc::clone(&bus),
            clock,
            AlgedonicConfig::default(),
        ));
        (chan, bus)
    }

    #[tokio::test]
    async fn test_sustained_latency_produces_bounded_pain() {
        let (chan, bus) = channel();
        let mut pain = bus.subscribe(topics::ALGEDONIC_PAIN).unwrap();

        for _ in 0..50 {
            chan.record_sample(hedonic::RESPONSE_TIME, 1000.0);
        }
        chan.assess();

        let event = pain.recv().await.unwrap();
        let intensity = event.data["intensity"].as_f64().unwrap();
        assert!((0.85..=0.95).contains(&intensity));
        assert_eq!(chan.state(), AlgedonicState::Pain);
        assert!(chan.intervention_active());
    }

    #[tokio::test]
    async fn test_assessment_tick_is_idempotent() {
        let (chan, bus) = channel();
        let mut pain = bus.subscribe(topics::ALGEDONIC_PAIN).unwrap();

        chan.record_sample(hedonic::RESPONSE_TIME, 1500.0);
        chan.assess();
        chan.assess();
        chan.assess();

        assert!(pain.recv().await.is_some());
        // No new samples between ticks: exactly one signal
        assert!(pain.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_scream_reaches_all_three_channels() {
        let (chan, bus) = channel();
        let mut emergency = bus.subscribe(topics::EMERGENCY_ALGEDONIC).unwrap();
        let mut override_line = bus.subscribe(topics::S5_EMERGENCY_OVERRIDE).unwrap();
        let mut broadcast = bus.subscribe(topics::ALL_SUBSYSTEMS).unwrap();

        chan.emergency_scream("s3", "control loop wedged");

        let signal = emergency.recv().await.unwrap();
        assert_eq!(signal.data["intensity"].as_f64().unwrap(), 1.0);
        assert_eq!(signal.data["severity"], "critical");

        assert!(override_line.recv().await.is_some());
        let mode = broadcast.recv().await.unwrap();
        assert_eq!(mode.data["emergency_mode"], true);
        assert_eq!(chan.state(), AlgedonicState::EmergencyActive);
    }

    #[tokio::test]
    async fn test_identical_screams_coalesce() {
        let (chan, bus) = channel();
        let mut emergency = bus.subscribe(topics::EMERGENCY_ALGEDONIC).unwrap();

        chan.emergency_scream("s1", "backlog");
        chan.emergency_scream("s1", "backlog");

        assert!(emergency.recv().await.is_some());
        assert!(emergency.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_criticals_in_window_force_shutdown() {
        let (chan, bus) = channel();
        let mut shutdown = bus.subscribe(topics::SYSTEM_SHUTDOWN).unwrap();

        chan.emergency_scream("s1", "a");
        tokio::time::advance(Duration::from_secs(10)).await;
        chan.emergency_scream("s2", "b");
        tokio::time::advance(Duration::from_secs(10)).await;
        chan.emergency_scream("s3", "c");

        let event = shutdown.try_recv().unwrap();
        assert_eq!(event.data["reason"], "algedonic_overload");
    }

    #[tokio::test(start_paused = true)]
    async fn test_criticals_spread_past_window_do_not_shutdown() {
        let (chan, bus) = channel();
        let mut shutdown = bus.subscribe(topics::SYSTEM_SHUTDOWN).unwrap();

        chan.emergency_scream("s1", "a");
        tokio::time::advance(Duration::from_secs(31)).await;
        chan.emergency_scream("s2", "b");
        tokio::time::advance(Duration::from_secs(30)).await;
        chan.emergency_scream("s3", "c");

        assert!(shutdown.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_subsystem_triggers_scream() {
        let (chan, bus) = channel();
        let mut emergency = bus.subscribe(topics::EMERGENCY_ALGEDONIC).unwrap();

        let clock = bus.clock();
        let health = Event::new(
            "s3_health",
            "s3",
            serde_json::json!({ "health": 0.9 }),
            clock.tick().unwrap(),
        );
        chan.ingest(&health);
        chan.assess();
        assert!(emergency.try_recv().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        chan.assess();

        let scream = emergency.recv().await.unwrap();
        assert_eq!(scream.data["source"], "s3");
    }

    #[tokio::test]
    async fn test_pleasure_clears_intervention_flag() {
        let (chan, bus) = channel();
        let mut pleasure = bus.subscribe(topics::ALGEDONIC_PLEASURE).unwrap();

        for _ in 0..10 {
            chan.record_sample(hedonic::RESPONSE_TIME, 600.0);
        }
        chan.assess();
        assert!(chan.intervention_active());

        // Cache hit rate above 0.95 reads as pleasure
        for _ in 0..10 {
            chan.record_sample(hedonic::CACHE_HIT_RATE, 0.99);
        }
        chan.assess();
        assert!(pleasure.recv().await.is_some());
        assert!(!chan.intervention_active());
    }
}
