//! # S4 - Intelligence
//!
//! Maintains an environmental model fed by S3 audits and its own scans.
//! Success patterns gain weight, failures lose it, and older evidence
//! decays exponentially with a one-hour half-life. The distilled product
//! (patterns, recommendations, anomalies) goes up to S5 over the S4→S5
//! channel.

use crate::error::Result;
use crate::types::{HealthReport, Subsystem, HEALTH_INTERVAL_MS};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vsm_channels::{VarietyChannel, VarietyPacket, VarietyType};
use vsm_core::{hlc, topics, EventBus, VsmLevel};

/// Retained anomaly notes
const ANOMALY_RING: usize = 50;

/// S4 tuning knobs
#[derive(Debug, Clone)]
pub struct S4Config {
    /// Evidence half-life
    pub half_life: Duration,
    /// Scenario sets retained in the library
    pub scenario_library: usize,
    /// Health ticks between intelligence reports to S5
    pub report_every_ticks: u64,
    /// Latency p95 considered anomalous during scans
    pub latency_anomaly_ms: f64,
}

impl Default for S4Config {
    fn default() -> Self {
        Self {
            half_life: Duration::from_secs(3600),
            scenario_library: 20,
            report_every_ticks: 10,
            latency_anomaly_ms: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct PatternEvidence {
    weight: f64,
    successes: u64,
    failures: u64,
    last_update_ms: u64,
}

/// One modeled scenario
#[derive(Debug, Clone, Serialize)]
pub struct Scenario {
    /// Scenario label
    pub name: String,
    /// Probability estimate in `[0, 1]`
    pub probability: f64,
    /// Projected impact description
    pub projected_impact: String,
    /// What S5 should consider doing
    pub recommendation: String,
}

/// Product of one environment scan
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    /// Patterns and their current evidence weights
    pub detected_patterns: Vec<(String, f64)>,
    /// Anomalies worth attention
    pub anomalies: Vec<String>,
    /// Derived recommendations
    pub recommendations: Vec<String>,
    /// Wall-clock milliseconds of the scan
    pub scanned_at_ms: u64,
}

/// The S4 intelligence subsystem
pub struct Intelligence {
    config: S4Config,
    bus: Arc<EventBus>,
    from_s3: Arc<VarietyChannel>,
    to_s5: Arc<VarietyChannel>,
    patterns: Mutex<HashMap<String, PatternEvidence>>,
    anomalies: Mutex<VecDeque<String>>,
    scenarios: Mutex<VecDeque<Vec<Scenario>>>,
}

impl Intelligence {
    /// Create S4 with its channels
    pub fn new(
        config: S4Config,
        bus: Arc<EventBus>,
        from_s3: Arc<VarietyChannel>,
        to_s5: Arc<VarietyChannel>,
    ) -> Self {
        Self {
            config,
            bus,
            from_s3,
            to_s5,
            patterns: Mutex::new(HashMap::new()),
            anomalies: Mutex::new(VecDeque::new()),
            scenarios: Mutex::new(VecDeque::new()),
        }
    }

    /// Fold one observation into the model
    ///
    /// Existing evidence decays by elapsed half-lives before the new
    /// observation lands: `weight·2^(−Δt/T) ± 1`.
    pub fn observe_pattern(&self, name: &str, success: bool) {
        let now = hlc::wall_ms();
        let half_life_ms = self.config.half_life.as_millis() as f64;
        let mut patterns = self.patterns.lock();
        let evidence = patterns.entry(name.to_string()).or_insert(PatternEvidence {
            weight: 0.0,
            successes: 0,
            failures: 0,
            last_update_ms: now,
        });

        let dt = now.saturating_sub(evidence.last_update_ms) as f64;
        evidence.weight *= 0.5f64.powf(dt / half_life_ms);
        if success {
            evidence.weight += 1.0;
            evidence.successes += 1;
        } else {
            evidence.weight -= 1.0;
            evidence.failures += 1;
        }
        evidence.last_update_ms = now;
    }

    /// Learn from one S3 audit entry
    ///
    /// The action is the pattern; an outcome that reads as a failure
    /// weighs against it, anything else in favor.
    pub fn learn_from_audit(&self, entry: &serde_json::Value) {
        let Some(action) = entry
            .get("action")
            .or_else(|| entry.get("decision"))
            .and_then(|a| a.as_str())
        else {
            return;
        };
        let outcome = entry
            .get("outcome")
            .and_then(|o| o.as_str())
            .unwrap_or("");
        let failed = outcome.contains("fail") || outcome.contains("worse");
        self.observe_pattern(action, !failed);
        self.bus.metrics().incr("s4.audits_learned");
    }

    /// Note an anomaly for the next report
    pub fn note_anomaly(&self, description: impl Into<String>) {
        let mut anomalies = self.anomalies.lock();
        if anomalies.len() >= ANOMALY_RING {
            anomalies.pop_front();
        }
        anomalies.push_back(description.into());
    }

    /// Scan the environment: metrics, model state, anomalies
    pub fn scan_environment(&self) -> EnvironmentReport {
        if let Some(summary) = self.bus.metrics().histogram_summary("s1.request_ms") {
            if summary.p95 > self.config.latency_anomaly_ms {
                self.note_anomaly(format!(
                    "s1 latency p95 at {:.0} ms over {} samples",
                    summary.p95, summary.count
                ));
            }
        }

        let patterns = self.patterns.lock();
        let mut detected: Vec<(String, f64)> = patterns
            .iter()
            .map(|(name, e)| (name.clone(), e.weight))
            .collect();
        detected.sort_by(|a, b| b.1.total_cmp(&a.1));

        let recommendations = detected
            .iter()
            .filter_map(|(name, weight)| {
                if *weight >= 2.0 {
                    Some(format!("prefer {}", name))
                } else if *weight <= -2.0 {
                    Some(format!("avoid {}", name))
                } else {
                    None
                }
            })
            .collect();

        EnvironmentReport {
            detected_patterns: detected,
            anomalies: self.anomalies.lock().iter().cloned().collect(),
            recommendations,
            scanned_at_ms: hlc::wall_ms(),
        }
    }

    /// Project scenarios for a hypothetical input
    pub fn model_scenario(&self, input: &serde_json::Value) -> Vec<Scenario> {
        let subject = input
            .get("subject")
            .and_then(|s| s.as_str())
            .unwrap_or("environment")
            .to_string();

        let reliability = {
            let patterns = self.patterns.lock();
            if patterns.is_empty() {
                0.5
            } else {
                let positive = patterns.values().filter(|e| e.weight > 0.0).count() as f64;
                positive / patterns.len() as f64
            }
        };

        let scenarios = vec![
            Scenario {
                name: format!("{}: steady", subject),
                probability: reliability,
                projected_impact: "current trends continue".to_string(),
                recommendation: "no policy change".to_string(),
            },
            Scenario {
                name: format!("{}: degraded", subject),
                probability: (1.0 - reliability) * 0.7,
                projected_impact: "known failure patterns recur".to_string(),
                recommendation: "tighten constraints on affected units".to_string(),
            },
            Scenario {
                name: format!("{}: novel", subject),
                probability: (1.0 - reliability) * 0.3,
                projected_impact: "behavior outside the model".to_string(),
                recommendation: "widen monitoring before constraining".to_string(),
            },
        ];

        let mut library = self.scenarios.lock();
        if library.len() >= self.config.scenario_library {
            library.pop_front();
        }
        library.push_back(scenarios.clone());
        scenarios
    }

    /// Current report for S5, including the latest scenario sets
    pub fn get_intelligence_report(&self) -> serde_json::Value {
        let report = self.scan_environment();
        let scenarios = self.scenarios.lock();
        serde_json::json!({
            "detected_patterns": report.detected_patterns,
            "recommendations": report.recommendations,
            "anomalies": report.anomalies,
            "scenario_sets": scenarios.len(),
            "generated_at_ms": report.scanned_at_ms,
        })
    }

    fn publish_report(&self) {
        let report = self.get_intelligence_report();
        let patterns: Vec<String> = report["detected_patterns"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|p| p[0].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        if let Ok(ts) = self.bus.clock().tick() {
            let _ = self.to_s5.transmit(VarietyPacket::new(
                VarietyType::Intelligence,
                patterns.len().max(1),
                patterns,
                report.clone(),
                ts,
            ));
        }
        let _ = self.bus.publish(topics::S4_INTELLIGENCE, "s4", report);
        self.bus.metrics().incr("s4.reports");
    }

    fn health_report(&self) -> HealthReport {
        // A model that keeps accumulating anti-patterns reads as strain
        let patterns = self.patterns.lock();
        let negative = patterns.values().filter(|e| e.weight < -2.0).count() as f64;
        let pressure = (negative * 0.1).min(0.5);
        HealthReport {
            health: (1.0 - pressure).clamp(0.0, 1.0),
            error_rate: 0.0,
            response_time_ms: 0.0,
            queue_depth: self.anomalies.lock().len() as f64,
            throughput: self.bus.metrics().counter("s4.reports") as f64,
        }
    }
}

#[async_trait]
impl Subsystem for Intelligence {
    fn level(&self) -> VsmLevel {
        VsmLevel::S4
    }

    async fn health(&self) -> f64 {
        self.health_report().health
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut s2_patterns = self.bus.subscribe(topics::S2_PATTERN_DETECTED)?;
        let mut ticker = tokio::time::interval(Duration::from_millis(HEALTH_INTERVAL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        info!("s4 intelligence running");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while let Some(packet) = self.from_s3.try_receive() {
                        self.learn_from_audit(&packet.payload);
                    }

                    let report = self.health_report();
                    if let Err(e) = self.bus.publish(
                        topics::S4_HEALTH,
                        "s4",
                        serde_json::to_value(&report).unwrap_or_default(),
                    ) {
                        warn!(error = %e, "s4 health publish failed");
                    }

                    ticks += 1;
                    if ticks % self.config.report_every_ticks == 0 {
                        self.publish_report();
                    }
                }
                event = s2_patterns.recv() => {
                    match event {
                        Some(event) => {
                            // An oscillation is evidence against whatever
                            // pattern of behavior produced it
                            if let Some(class) = event.data.get("class").and_then(|c| c.as_str()) {
                                self.observe_pattern(&format!("oscillation:{}", class), false);
                                self.note_anomaly(format!(
                                    "oscillation {} between {:?}",
                                    class,
                                    event.data.get("units")
                                ));
                            }
                            debug!("s2 pattern absorbed");
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("s4 intelligence stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsm_channels::ChannelKind;
    use vsm_core::{HybridLogicalClock, MetricsRegistry};

    fn s4() -> (Intelligence, Arc<EventBus>) {
        let clock = Arc::new(HybridLogicalClock::new("s4-test"));
        let bus = Arc::new(EventBus::new(clock, Arc::new(MetricsRegistry::new())));
        let from_s3 = Arc::new(VarietyChannel::new(ChannelKind::S3ToS4, Arc::clone(&bus)));
        let to_s5 = Arc::new(VarietyChannel::new(ChannelKind::S4ToS5, Arc::clone(&bus)));
        (
            Intelligence::new(S4Config::default(), Arc::clone(&bus), from_s3, to_s5),
            bus,
        )
    }

    #[tokio::test]
    async fn test_success_and_failure_move_weights() {
        let (s4, _bus) = s4();
        s4.observe_pattern("throttle", true);
        s4.observe_pattern("throttle", true);
        s4.observe_pattern("restart", false);

        let report = s4.scan_environment();
        let weights: HashMap<_, _> = report.detected_patterns.into_iter().collect();
        assert!(weights["throttle"] > 1.9);
        assert!(weights["restart"] < 0.0);
    }

    #[tokio::test]
    async fn test_recommendations_follow_evidence() {
        let (s4, _bus) = s4();
        for _ in 0..3 {
            s4.observe_pattern("throttle", true);
            s4.observe_pattern("hard_restart", false);
        }

        let report = s4.scan_environment();
        assert!(report.recommendations.contains(&"prefer throttle".to_string()));
        assert!(report.recommendations.contains(&"avoid hard_restart".to_string()));
    }

    #[tokio::test]
    async fn test_learns_from_audit_payloads() {
        let (s4, _bus) = s4();
        s4.learn_from_audit(&serde_json::json!({
            "action": "throttle",
            "outcome": "pressure relieved",
        }));
        s4.learn_from_audit(&serde_json::json!({
            "action": "throttle",
            "outcome": "made things worse",
        }));

        let report = s4.scan_environment();
        let weights: HashMap<_, _> = report.detected_patterns.into_iter().collect();
        // One success and one failure cancel out (modulo tiny decay)
        assert!(weights["throttle"].abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_scenarios_enter_the_library() {
        let (s4, _bus) = s4();
        let scenarios = s4.model_scenario(&serde_json::json!({ "subject": "cpu load" }));
        assert_eq!(scenarios.len(), 3);
        assert!(scenarios.iter().any(|s| s.name.contains("cpu load")));

        let report = s4.get_intelligence_report();
        assert_eq!(report["scenario_sets"], 1);
    }

    #[tokio::test]
    async fn test_report_reaches_s5_channel() {
        let (s4, bus) = s4();
        let mut intelligence = bus.subscribe(topics::S4_INTELLIGENCE).unwrap();

        s4.observe_pattern("throttle", true);
        s4.publish_report();

        let packet = s4.to_s5.try_receive().unwrap();
        assert_eq!(packet.packet_type, VarietyType::Intelligence);
        assert!(intelligence.recv().await.is_some());
    }
}
