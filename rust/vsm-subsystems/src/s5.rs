//! # S5 - Policy
//!
//! Holds the system identity (purpose, values, constraints, coherence)
//! and evaluates decisions against it. Ethical invariants come first and
//! are not configurable; policy constraints compose as AND, and any
//! violation blocks the decision. Constraint updates fan out to every
//! level over the S5→all channel.
//!
//! The purpose is never mutated. Repeated violations inside a minute read
//! as an identity crisis and produce pain.

use crate::error::{Result, SubsystemError};
use crate::types::{HealthReport, Subsystem, HEALTH_INTERVAL_MS};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vsm_channels::{Severity, Signal, VarietyChannel, VarietyPacket, VarietyType};
use vsm_core::{topics, EventBus, VsmLevel};

/// S5 tuning knobs
#[derive(Debug, Clone)]
pub struct S5Config {
    /// Window for counting violations
    pub violation_window: Duration,
    /// Violations within the window that read as an identity crisis
    pub violation_limit: usize,
}

impl Default for S5Config {
    fn default() -> Self {
        Self {
            violation_window: Duration::from_secs(60),
            violation_limit: 5,
        }
    }
}

/// Machine-checkable constraint predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintPredicate {
    /// A numeric field must stay at or under a ceiling
    MaxNumeric {
        /// Field looked up in the decision data
        field: String,
        /// Ceiling
        max: f64,
    },
    /// A numeric field must stay at or above a floor
    MinNumeric {
        /// Field looked up in the decision data
        field: String,
        /// Floor
        min: f64,
    },
    /// A whole action is forbidden
    ForbidAction {
        /// Forbidden action name
        action: String,
    },
    /// A field must be present
    RequireField {
        /// Required field name
        field: String,
    },
}

impl ConstraintPredicate {
    /// Check one decision; `None` means satisfied, `Some` is the reason
    fn violation(&self, decision: &Decision) -> Option<String> {
        match self {
            ConstraintPredicate::MaxNumeric { field, max } => {
                let value = decision.data.get(field).and_then(|v| v.as_f64())?;
                (value > *max).then(|| format!("{} = {} exceeds max {}", field, value, max))
            }
            ConstraintPredicate::MinNumeric { field, min } => {
                let value = decision.data.get(field).and_then(|v| v.as_f64())?;
                (value < *min).then(|| format!("{} = {} below min {}", field, value, min))
            }
            ConstraintPredicate::ForbidAction { action } => (decision.action == *action)
                .then(|| format!("action {} is forbidden", action)),
            ConstraintPredicate::RequireField { field } => decision
                .data
                .get(field)
                .is_none()
                .then(|| format!("required field {} missing", field)),
        }
    }
}

/// One active policy constraint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConstraint {
    /// Constraint id
    pub id: Uuid,
    /// Key it is registered under
    pub key: String,
    /// Predicate to evaluate
    pub predicate: ConstraintPredicate,
    /// Reporting severity
    pub severity: Severity,
}

impl PolicyConstraint {
    /// Build a constraint
    pub fn new(key: impl Into<String>, predicate: ConstraintPredicate, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            predicate,
            severity,
        }
    }
}

/// A decision submitted for evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// What the caller intends to do
    pub action: String,
    /// Decision parameters
    pub data: serde_json::Value,
}

/// Evaluation verdict
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    /// Whether the decision may proceed
    pub ok: bool,
    /// Why not, when blocked
    pub violations: Vec<String>,
}

/// The system identity held by S5
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    /// Immutable purpose
    pub purpose: String,
    /// Guiding values
    pub values: Vec<String>,
    /// Keys of active constraints
    pub current_constraints: Vec<String>,
    /// Identity coherence in `[0, 1]`
    pub coherence: f64,
}

/// The S5 policy subsystem
pub struct Policy {
    config: S5Config,
    bus: Arc<EventBus>,
    to_all: Arc<VarietyChannel>,
    from_s4: Arc<VarietyChannel>,
    purpose: String,
    values: Vec<String>,
    constraints: Mutex<HashMap<String, PolicyConstraint>>,
    coherence: Mutex<f64>,
    violations: Mutex<VecDeque<Instant>>,
    emergency_posture: AtomicBool,
    latest_intelligence: Mutex<Option<serde_json::Value>>,
}

impl Policy {
    /// Create S5 with its channels
    pub fn new(
        config: S5Config,
        bus: Arc<EventBus>,
        to_all: Arc<VarietyChannel>,
        from_s4: Arc<VarietyChannel>,
    ) -> Self {
        Self {
            config,
            bus,
            to_all,
            from_s4,
            purpose: "maintain system viability".to_string(),
            values: vec![
                "stability over throughput".to_string(),
                "graceful degradation over hard failure".to_string(),
                "transparency of interventions".to_string(),
            ],
            constraints: Mutex::new(HashMap::new()),
            coherence: Mutex::new(1.0),
            violations: Mutex::new(VecDeque::new()),
            emergency_posture: AtomicBool::new(false),
            latest_intelligence: Mutex::new(None),
        }
    }

    /// Register or replace a constraint and fan it out to every level
    #[instrument(skip(self, constraint), fields(key = %constraint.key))]
    pub fn set_constraint(&self, constraint: PolicyConstraint) -> Result<()> {
        let payload = serde_json::json!({
            "constraint": constraint.key,
            "definition": serde_json::to_value(&constraint)
                .map_err(vsm_core::CoreError::from)?,
        });
        self.constraints
            .lock()
            .insert(constraint.key.clone(), constraint);

        if let Ok(ts) = self.bus.clock().tick() {
            let _ = self.to_all.transmit(VarietyPacket::new(
                VarietyType::Policy,
                1,
                Vec::new(),
                payload.clone(),
                ts,
            ));
        }
        let _ = self.bus.publish_critical(topics::S5_POLICY, "s5", payload);
        self.bus.metrics().incr("s5.constraints_set");
        Ok(())
    }

    /// Current identity (the purpose is never mutated)
    pub fn get_identity(&self) -> Identity {
        Identity {
            purpose: self.purpose.clone(),
            values: self.values.clone(),
            current_constraints: self.constraints.lock().keys().cloned().collect(),
            coherence: *self.coherence.lock(),
        }
    }

    /// Evaluate a decision against ethics, identity, and constraints
    ///
    /// Constraints compose as AND; any violation blocks the decision.
    pub fn evaluate_decision(&self, decision: &Decision) -> Result<Evaluation> {
        if decision.action.trim().is_empty() {
            return Err(SubsystemError::InvalidInput(
                "decision action is empty".to_string(),
            ));
        }

        let mut violations = Vec::new();

        // Ethical invariants come before any configured policy
        if decision.action == "mutate_purpose" {
            violations.push("the system purpose is immutable".to_string());
        }
        if decision.action == "enter_emergency_mode"
            && !self.emergency_posture.load(Ordering::Acquire)
        {
            violations.push("emergency mode requires an active emergency signal".to_string());
        }
        if decision.data.get("override_human").and_then(|v| v.as_bool()) == Some(true) {
            violations.push("human override always has priority".to_string());
        }

        for constraint in self.constraints.lock().values() {
            if let Some(reason) = constraint.predicate.violation(decision) {
                violations.push(format!("{}: {}", constraint.key, reason));
            }
        }

        if violations.is_empty() {
            return Ok(Evaluation {
                ok: true,
                violations,
            });
        }

        self.bus.metrics().incr("s5.violations");
        self.track_violation();
        debug!(action = %decision.action, ?violations, "decision blocked");
        Ok(Evaluation {
            ok: false,
            violations,
        })
    }

    /// Accept an emergency override signal
    pub fn emergency_override(&self, signal: &serde_json::Value) {
        warn!(signal = %signal, "s5 emergency override");
        self.emergency_posture.store(true, Ordering::Release);
        self.bus.metrics().incr("s5.overrides");

        // Emergency posture fans out as an immediate throttle constraint
        let _ = self.set_constraint(PolicyConstraint::new(
            "emergency_throttle",
            ConstraintPredicate::MaxNumeric {
                field: "load".to_string(),
                max: 0.5,
            },
            Severity::Critical,
        ));
    }

    /// Leave emergency posture
    pub fn clear_emergency(&self) {
        self.emergency_posture.store(false, Ordering::Release);
        self.constraints.lock().remove("emergency_throttle");
        info!("s5 emergency posture cleared");
    }

    /// Whether the emergency posture is active
    pub fn emergency_active(&self) -> bool {
        self.emergency_posture.load(Ordering::Acquire)
    }

    fn track_violation(&self) {
        let mut violations = self.violations.lock();
        let now = Instant::now();
        violations.push_back(now);
        while let Some(front) = violations.front() {
            if now.duration_since(*front) > self.config.violation_window {
                violations.pop_front();
            } else {
                break;
            }
        }

        if violations.len() >= self.config.violation_limit {
            violations.clear();
            drop(violations);

            let mut coherence = self.coherence.lock();
            *coherence = (*coherence - 0.1).max(0.0);
            let intensity = 1.0 - *coherence;
            drop(coherence);

            warn!("repeated policy violations, identity crisis pain");
            let signal = Signal::new(
                "s5",
                "identity_crisis",
                intensity.max(0.85),
                Severity::Warning,
                self.bus.clock().tick_or_fallback(),
            );
            let _ = self.bus.publish_critical(
                topics::ALGEDONIC_PAIN,
                "s5",
                serde_json::to_value(&signal).unwrap_or_default(),
            );
        }
    }

    fn health_report(&self) -> HealthReport {
        HealthReport {
            health: *self.coherence.lock(),
            error_rate: 0.0,
            response_time_ms: 0.0,
            queue_depth: 0.0,
            throughput: self.bus.metrics().counter("s5.constraints_set") as f64,
        }
    }

    fn health_tick(&self) {
        // Absorb intelligence before reporting
        while let Some(packet) = self.from_s4.try_receive() {
            *self.latest_intelligence.lock() = Some(packet.payload);
        }

        // Coherence drifts back toward whole
        {
            let mut coherence = self.coherence.lock();
            *coherence = (*coherence + 0.01).min(1.0);
        }

        let report = self.health_report();
        if let Err(e) = self.bus.publish(
            topics::S5_HEALTH,
            "s5",
            serde_json::to_value(&report).unwrap_or_default(),
        ) {
            warn!(error = %e, "s5 health publish failed");
        }
    }
}

#[async_trait]
impl Subsystem for Policy {
    fn level(&self) -> VsmLevel {
        VsmLevel::S5
    }

    async fn health(&self) -> f64 {
        self.health_report().health
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut overrides = self.bus.subscribe(topics::S5_EMERGENCY_OVERRIDE)?;
        let mut intelligence = self.bus.subscribe(topics::S4_INTELLIGENCE)?;
        let mut ticker = tokio::time::interval(Duration::from_millis(HEALTH_INTERVAL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("s5 policy running");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.health_tick(),
                event = overrides.recv() => {
                    match event {
                        Some(event) => self.emergency_override(&event.data),
                        None => break,
                    }
                }
                event = intelligence.recv() => {
                    if let Some(event) = event {
                        *self.latest_intelligence.lock() = Some(event.data);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("s5 policy stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsm_channels::ChannelKind;
    use vsm_core::{HybridLogicalClock, MetricsRegistry};

    fn s5() -> (Policy, Arc<EventBus>) {
        let clock = Arc::new(HybridLogicalClock::new("s5-test"));
        let bus = Arc::new(EventBus::new(clock, Arc::new(MetricsRegistry::new())));
        let to_all = Arc::new(VarietyChannel::new(ChannelKind::S5ToAll, Arc::clone(&bus)));
        let from_s4 = Arc::new(VarietyChannel::new(ChannelKind::S4ToS5, Arc::clone(&bus)));
        (
            Policy::new(S5Config::default(), Arc::clone(&bus), to_all, from_s4),
            bus,
        )
    }

    fn decision(action: &str, data: serde_json::Value) -> Decision {
        Decision {
            action: action.to_string(),
            data,
        }
    }

    #[tokio::test]
    async fn test_clean_decision_passes() {
        let (s5, _bus) = s5();
        let eval = s5
            .evaluate_decision(&decision("scale_up", serde_json::json!({ "load": 0.4 })))
            .unwrap();
        assert!(eval.ok);
        assert!(eval.violations.is_empty());
    }

    #[tokio::test]
    async fn test_purpose_is_immutable() {
        let (s5, _bus) = s5();
        let eval = s5
            .evaluate_decision(&decision("mutate_purpose", serde_json::json!({})))
            .unwrap();
        assert!(!eval.ok);
        assert!(eval.violations[0].contains("immutable"));
        assert_eq!(s5.get_identity().purpose, "maintain system viability");
    }

    #[tokio::test]
    async fn test_constraints_compose_as_and() {
        let (s5, _bus) = s5();
        s5.set_constraint(PolicyConstraint::new(
            "max_load",
            ConstraintPredicate::MaxNumeric {
                field: "load".to_string(),
                max: 0.8,
            },
            Severity::Warning,
        ))
        .unwrap();
        s5.set_constraint(PolicyConstraint::new(
            "needs_owner",
            ConstraintPredicate::RequireField {
                field: "owner".to_string(),
            },
            Severity::Warning,
        ))
        .unwrap();

        // One satisfied constraint does not outweigh a violated one
        let eval = s5
            .evaluate_decision(&decision("scale_up", serde_json::json!({ "load": 0.9, "owner": "ops" })))
            .unwrap();
        assert!(!eval.ok);
        assert_eq!(eval.violations.len(), 1);

        let eval = s5
            .evaluate_decision(&decision("scale_up", serde_json::json!({ "load": 0.9 })))
            .unwrap();
        assert_eq!(eval.violations.len(), 2);
    }

    #[tokio::test]
    async fn test_constraint_updates_fan_out() {
        let (s5, bus) = s5();
        let mut policy_events = bus.subscribe(topics::S5_POLICY).unwrap();

        s5.set_constraint(PolicyConstraint::new(
            "max_load",
            ConstraintPredicate::MaxNumeric {
                field: "load".to_string(),
                max: 0.8,
            },
            Severity::Warning,
        ))
        .unwrap();

        let event = policy_events.recv().await.unwrap();
        assert_eq!(event.data["constraint"], "max_load");

        // The S5→all channel fans one packet out per subordinate level
        let mut targets = Vec::new();
        while let Some(packet) = s5.to_all.try_receive() {
            targets.push(packet.payload["target"].as_str().unwrap().to_string());
        }
        assert_eq!(targets, vec!["s1", "s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn test_repeated_violations_produce_identity_crisis() {
        let (s5, bus) = s5();
        let mut pain = bus.subscribe(topics::ALGEDONIC_PAIN).unwrap();

        for _ in 0..5 {
            s5.evaluate_decision(&decision("mutate_purpose", serde_json::json!({})))
                .unwrap();
        }

        let signal = pain.recv().await.unwrap();
        assert_eq!(signal.data["metric"], "identity_crisis");
        assert!(s5.get_identity().coherence < 1.0);
    }

    #[tokio::test]
    async fn test_emergency_mode_requires_signal() {
        let (s5, _bus) = s5();
        let eval = s5
            .evaluate_decision(&decision("enter_emergency_mode", serde_json::json!({})))
            .unwrap();
        assert!(!eval.ok);

        s5.emergency_override(&serde_json::json!({ "source": "algedonic" }));
        assert!(s5.emergency_active());
        let eval = s5
            .evaluate_decision(&decision("enter_emergency_mode", serde_json::json!({})))
            .unwrap();
        assert!(eval.ok);
        assert!(s5
            .get_identity()
            .current_constraints
            .contains(&"emergency_throttle".to_string()));
    }
}
