//! # S3 - Control
//!
//! Closes the loop back to S1. S3 owns the resource pools outright (all
//! reservations flow through it), decides allocations from the
//! aggregated S2 view under S5 constraints, and pushes control commands
//! down the amplifying S3→S1 channel.
//!
//! Every intervention lands in the audit trail with its inputs, decision,
//! timestamp, and observed outcome; repeated identical interventions
//! inside the debounce window collapse into one entry. Emergency mode is
//! entered on an emergency algedonic or an S5 override and exits only
//! after health stays above 0.7 for ten seconds.

pub mod audit;
pub mod resources;

pub use audit::{AuditEntry, AuditLog};
pub use resources::{PoolSnapshot, ResourceKind, ResourcePool};

use crate::error::{Result, SubsystemError};
use crate::types::{HealthReport, Subsystem, HEALTH_INTERVAL_MS};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vsm_channels::{VarietyChannel, VarietyPacket, VarietyType};
use vsm_core::{topics, EventBus, VsmLevel};

/// S3 tuning knobs
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Identical interventions inside this window collapse
    pub debounce: Duration,
    /// Grace tick reclaiming expired reservations
    pub grace_tick: Duration,
    /// Default reservation TTL
    pub reservation_ttl: Duration,
    /// Health required to leave emergency mode
    pub emergency_exit_health: f64,
    /// How long health must stay above the bar
    pub emergency_exit_sustain: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            grace_tick: Duration::from_millis(500),
            reservation_ttl: Duration::from_secs(30),
            emergency_exit_health: 0.7,
            emergency_exit_sustain: Duration::from_secs(10),
        }
    }
}

/// Control state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    /// Steady state
    Normal,
    /// Watching a developing situation
    Monitoring,
    /// Actively issuing commands
    Intervening,
    /// Emergency posture
    Emergency,
}

/// Result of an intervention request
#[derive(Debug, Clone, Serialize)]
pub enum InterventionOutcome {
    /// Command issued; audit entry recorded
    Applied {
        /// Audit entry id
        audit_id: Uuid,
    },
    /// Identical intervention inside the debounce window
    Debounced,
}

/// Snapshot returned by `get_control_state`
#[derive(Debug, Clone, Serialize)]
pub struct ControlSnapshot {
    /// State machine position
    pub state: ControlState,
    /// Pool views
    pub pools: HashMap<String, PoolSnapshot>,
    /// Audit entries retained
    pub audit_entries: usize,
    /// Constraints currently honored from S5
    pub active_constraints: usize,
}

/// The S3 control subsystem
pub struct Control {
    config: S3Config,
    bus: Arc<EventBus>,
    from_s2: Arc<VarietyChannel>,
    to_s1: Arc<VarietyChannel>,
    to_s4: Arc<VarietyChannel>,
    pools: Mutex<HashMap<ResourceKind, ResourcePool>>,
    audit: Mutex<AuditLog>,
    recent_interventions: Mutex<HashMap<(String, String), Instant>>,
    state: Mutex<ControlState>,
    healthy_since: Mutex<Option<Instant>>,
    latest_summary: Mutex<Option<serde_json::Value>>,
    constraints: Mutex<HashMap<String, serde_json::Value>>,
}

impl Control {
    /// Create S3 with its three channels
    pub fn new(
        config: S3Config,
        bus: Arc<EventBus>,
        from_s2: Arc<VarietyChannel>,
        to_s1: Arc<VarietyChannel>,
        to_s4: Arc<VarietyChannel>,
    ) -> Self {
        let mut pools = HashMap::new();
        for kind in ResourceKind::ALL {
            pools.insert(kind, ResourcePool::new(1.0));
        }

        Self {
            config,
            bus,
            from_s2,
            to_s1,
            to_s4,
            pools: Mutex::new(pools),
            audit: Mutex::new(AuditLog::new()),
            recent_interventions: Mutex::new(HashMap::new()),
            state: Mutex::new(ControlState::Normal),
            healthy_since: Mutex::new(None),
            latest_summary: Mutex::new(None),
            constraints: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve pooled resources for a unit (TTL-bounded)
    pub fn reserve_resources(&self, unit: &str, kind: ResourceKind, amount: f64) -> Result<()> {
        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(&kind)
            .ok_or_else(|| SubsystemError::NotFound(format!("pool {}", kind)))?;
        pool.reserve(unit, amount, Some(self.config.reservation_ttl))?;
        self.bus.metrics().incr("s3.reservations");
        Ok(())
    }

    /// Release every reservation a unit holds
    pub fn release_resources(&self, unit: &str) -> f64 {
        let mut freed = 0.0;
        let mut pools = self.pools.lock();
        for pool in pools.values_mut() {
            freed += pool.release(unit);
        }
        freed
    }

    /// Issue a control intervention
    ///
    /// Identical `(target, action)` pairs inside the debounce window are
    /// collapsed into the first audit entry.
    #[instrument(skip(self))]
    pub fn intervene(&self, target: &str, action: &str) -> Result<InterventionOutcome> {
        {
            let mut recent = self.recent_interventions.lock();
            let key = (target.to_string(), action.to_string());
            let now = Instant::now();
            if let Some(at) = recent.get(&key) {
                if now.duration_since(*at) < self.config.debounce {
                    debug!(target, action, "intervention debounced");
                    self.bus.metrics().incr("s3.interventions_debounced");
                    return Ok(InterventionOutcome::Debounced);
                }
            }
            recent.insert(key, now);
        }

        let inputs = self
            .latest_summary
            .lock()
            .clone()
            .unwrap_or(serde_json::json!({}));
        let entry = AuditEntry::new(
            target,
            action,
            inputs,
            format!("apply {} to {}", action, target),
        );
        let audit_id = self.audit.lock().record(entry);

        {
            let mut state = self.state.lock();
            if *state == ControlState::Normal || *state == ControlState::Monitoring {
                *state = ControlState::Intervening;
            }
        }

        let command = serde_json::json!({
            "command": action,
            "unit_id": target,
            "units": [target],
            "audit_id": audit_id,
        });
        if let Ok(ts) = self.bus.clock().tick() {
            let _ = self.to_s1.transmit(VarietyPacket::new(
                VarietyType::Control,
                1,
                vec![action.to_string()],
                command.clone(),
                ts,
            ));
        }
        let _ = self.bus.publish_critical(topics::S3_CONTROL, "s3", command);
        self.bus.metrics().incr("s3.interventions");
        info!(target, action, %audit_id, "intervention issued");

        Ok(InterventionOutcome::Applied { audit_id })
    }

    /// Attach the observed outcome to an earlier intervention
    pub fn record_outcome(&self, audit_id: Uuid, outcome: impl Into<String>) -> bool {
        self.audit.lock().set_outcome(audit_id, outcome)
    }

    /// Rebalance the pools from the latest S2 aggregate
    ///
    /// Over-utilized pools shed expired reservations first, then throttle
    /// their heaviest holders; each adjustment is audited.
    pub fn optimize_resources(&self) -> Result<Vec<AuditEntry>> {
        let mut adjusted = Vec::new();

        let heavy: Vec<(ResourceKind, String)> = {
            let mut pools = self.pools.lock();
            let mut heavy = Vec::new();
            for (kind, pool) in pools.iter_mut() {
                pool.release_expired();
                let snap = pool.snapshot();
                if snap.total > 0.0 && snap.allocated / snap.total > 0.9 {
                    if let Some((unit, _)) = snap
                        .reservations
                        .iter()
                        .max_by(|(_, a), (_, b)| a.total_cmp(b))
                    {
                        heavy.push((*kind, unit.clone()));
                    }
                }
            }
            heavy
        };

        for (kind, unit) in heavy {
            if let InterventionOutcome::Applied { audit_id } = self.intervene(&unit, "throttle")? {
                self.record_outcome(audit_id, format!("{} pressure relieved", kind));
                if let Some(entry) = self
                    .audit
                    .lock()
                    .window(60_000)
                    .into_iter()
                    .find(|e| e.id == audit_id)
                {
                    adjusted.push(entry);
                }
            }
        }

        self.bus.metrics().incr("s3.optimizations");
        Ok(adjusted)
    }

    /// Audit entries within the trailing window
    pub fn get_audit_trail(&self, window_ms: u64) -> Vec<AuditEntry> {
        self.audit.lock().window(window_ms)
    }

    /// Current control snapshot
    pub fn get_control_state(&self) -> ControlSnapshot {
        let pools = self.pools.lock();
        ControlSnapshot {
            state: *self.state.lock(),
            pools: pools
                .iter()
                .map(|(kind, p)| (kind.as_str().to_string(), p.snapshot()))
                .collect(),
            audit_entries: self.audit.lock().len(),
            active_constraints: self.constraints.lock().len(),
        }
    }

    /// Enter emergency posture (algedonic or S5-driven)
    pub fn enter_emergency(&self, reason: &str) {
        let mut state = self.state.lock();
        if *state != ControlState::Emergency {
            warn!(reason, "s3 entering emergency mode");
            *state = ControlState::Emergency;
            *self.healthy_since.lock() = None;
            self.bus.metrics().incr("s3.emergencies");
        }
    }

    fn health_report(&self) -> HealthReport {
        let pools = self.pools.lock();
        let pressure = pools
            .values()
            .map(|p| {
                let snap = p.snapshot();
                if snap.total > 0.0 {
                    snap.allocated / snap.total
                } else {
                    0.0
                }
            })
            .fold(0.0f64, f64::max);
        drop(pools);

        let emergency_penalty = if *self.state.lock() == ControlState::Emergency {
            0.2
        } else {
            0.0
        };
        let health = (1.0 - 0.4 * pressure - emergency_penalty).clamp(0.0, 1.0);

        HealthReport {
            health,
            error_rate: 0.0,
            response_time_ms: 0.0,
            queue_depth: 0.0,
            throughput: self.bus.metrics().counter("s3.interventions") as f64,
        }
    }

    fn health_tick(&self) {
        // Absorb the S2 aggregate before judging state
        while let Some(packet) = self.from_s2.try_receive() {
            *self.latest_summary.lock() = Some(packet.payload.clone());
            if let Ok(ts) = self.bus.clock().tick() {
                let _ = self.to_s4.transmit(VarietyPacket::new(
                    VarietyType::Audit,
                    packet.volume,
                    packet.patterns,
                    serde_json::json!({
                        "decision": "coordination_summary_absorbed",
                        "outcome": packet.payload,
                    }),
                    ts,
                ));
            }
        }

        let report = self.health_report();
        if let Err(e) = self.bus.publish(
            topics::S3_HEALTH,
            "s3",
            serde_json::to_value(&report).unwrap_or_default(),
        ) {
            warn!(error = %e, "s3 health publish failed");
        }

        // Emergency exit requires sustained recovery
        let mut state = self.state.lock();
        match *state {
            ControlState::Emergency => {
                if report.health > self.config.emergency_exit_health {
                    let mut since = self.healthy_since.lock();
                    let start = since.get_or_insert_with(Instant::now);
                    if start.elapsed() >= self.config.emergency_exit_sustain {
                        info!("s3 leaving emergency mode");
                        *state = ControlState::Normal;
                        *since = None;
                    }
                } else {
                    *self.healthy_since.lock() = None;
                }
            }
            ControlState::Intervening => {
                // Interventions settle back to monitoring after a tick
                *state = ControlState::Monitoring;
            }
            ControlState::Monitoring => {
                if report.health > 0.9 {
                    *state = ControlState::Normal;
                }
            }
            ControlState::Normal => {}
        }
    }

    fn grace_tick(&self) {
        let mut reclaimed = Vec::new();
        {
            let mut pools = self.pools.lock();
            for (kind, pool) in pools.iter_mut() {
                for (unit, amount) in pool.release_expired() {
                    reclaimed.push((*kind, unit, amount));
                }
            }
        }
        for (kind, unit, amount) in reclaimed {
            debug!(%kind, unit, amount, "expired reservation reclaimed");
            self.bus.metrics().incr("s3.reservations_reclaimed");
        }
    }
}

#[async_trait]
impl Subsystem for Control {
    fn level(&self) -> VsmLevel {
        VsmLevel::S3
    }

    async fn health(&self) -> f64 {
        self.health_report().health
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut intervention_required = self.bus.subscribe(topics::S3_INTERVENTION_REQUIRED)?;
        let mut emergency = self.bus.subscribe(topics::EMERGENCY_ALGEDONIC)?;
        let mut policy = self.bus.subscribe(topics::S5_POLICY)?;

        let mut health_ticker = tokio::time::interval(Duration::from_millis(HEALTH_INTERVAL_MS));
        health_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut grace_ticker = tokio::time::interval(self.config.grace_tick);
        grace_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("s3 control running");
        loop {
            tokio::select! {
                _ = health_ticker.tick() => self.health_tick(),
                _ = grace_ticker.tick() => self.grace_tick(),
                event = intervention_required.recv() => {
                    match event {
                        Some(event) => {
                            let target = event
                                .data
                                .get("source")
                                .and_then(|s| s.as_str())
                                .unwrap_or("s1")
                                .to_string();
                            let _ = self.intervene(&target, "throttle");
                        }
                        None => break,
                    }
                }
                event = emergency.recv() => {
                    if event.is_some() {
                        self.enter_emergency("emergency algedonic signal");
                    }
                }
                event = policy.recv() => {
                    if let Some(event) = event {
                        if let Some(key) = event.data.get("constraint").and_then(|c| c.as_str()) {
                            self.constraints
                                .lock()
                                .insert(key.to_string(), event.data.clone());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("s3 control stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsm_channels::ChannelKind;
    use vsm_core::{HybridLogicalClock, MetricsRegistry};

    fn s3() -> (Control, Arc<EventBus>) {
        let clock = Arc::new(HybridLogicalClock::new("s3-test"));
        let bus = Arc::new(EventBus::new(clock, Arc::new(MetricsRegistry::new())));
        let from_s2 = Arc::new(VarietyChannel::new(ChannelKind::S2ToS3, Arc::clone(&bus)));
        let to_s1 = Arc::new(VarietyChannel::new(ChannelKind::S3ToS1, Arc::clone(&bus)));
        let to_s4 = Arc::new(VarietyChannel::new(ChannelKind::S3ToS4, Arc::clone(&bus)));
        (
            Control::new(S3Config::default(), Arc::clone(&bus), from_s2, to_s1, to_s4),
            bus,
        )
    }

    #[tokio::test]
    async fn test_intervention_is_audited_and_commanded() {
        let (s3, bus) = s3();
        let mut control = bus.subscribe(topics::S3_CONTROL).unwrap();

        let outcome = s3.intervene("s1_2", "throttle").unwrap();
        assert!(matches!(outcome, InterventionOutcome::Applied { .. }));

        let event = control.recv().await.unwrap();
        assert_eq!(event.data["command"], "throttle");
        assert_eq!(event.data["unit_id"], "s1_2");

        let trail = s3.get_audit_trail(60_000);
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, "throttle");
    }

    #[tokio::test]
    async fn test_repeated_interventions_collapse_within_debounce() {
        let (s3, _bus) = s3();

        let first = s3.intervene("s1_2", "throttle").unwrap();
        let second = s3.intervene("s1_2", "throttle").unwrap();
        assert!(matches!(first, InterventionOutcome::Applied { .. }));
        assert!(matches!(second, InterventionOutcome::Debounced));

        // A single audit entry for the pair
        assert_eq!(s3.get_audit_trail(60_000).len(), 1);
    }

    #[tokio::test]
    async fn test_outcome_lands_on_the_audit_entry() {
        let (s3, _bus) = s3();
        let InterventionOutcome::Applied { audit_id } =
            s3.intervene("s1_1", "resume").unwrap()
        else {
            panic!("expected applied");
        };

        assert!(s3.record_outcome(audit_id, "load back to normal"));
        let trail = s3.get_audit_trail(60_000);
        assert_eq!(trail[0].outcome.as_deref(), Some("load back to normal"));
    }

    #[tokio::test]
    async fn test_control_packets_amplify_to_units() {
        let (s3, _bus) = s3();
        s3.intervene("s1_3", "emergency_stop").unwrap();

        let packet = s3.to_s1.try_receive().unwrap();
        assert_eq!(packet.packet_type, VarietyType::Control);
        assert_eq!(packet.payload["unit_id"], "s1_3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_exit_needs_sustained_health() {
        let (s3, _bus) = s3();
        s3.enter_emergency("test");
        assert_eq!(s3.get_control_state().state, ControlState::Emergency);

        // Healthy ticks must accumulate ten seconds before exit
        s3.health_tick();
        tokio::time::advance(Duration::from_secs(5)).await;
        s3.health_tick();
        assert_eq!(s3.get_control_state().state, ControlState::Emergency);

        tokio::time::advance(Duration::from_secs(5)).await;
        s3.health_tick();
        assert_eq!(s3.get_control_state().state, ControlState::Normal);
    }

    #[tokio::test]
    async fn test_reservations_flow_through_pools() {
        let (s3, _bus) = s3();
        s3.reserve_resources("s1_1", ResourceKind::Cpu, 0.5).unwrap();
        s3.reserve_resources("s1_2", ResourceKind::Cpu, 0.4).unwrap();

        let err = s3.reserve_resources("s1_3", ResourceKind::Cpu, 0.2);
        assert!(matches!(err, Err(SubsystemError::ResourceExhausted { .. })));

        assert!((s3.release_resources("s1_1") - 0.5).abs() < 1e-9);
        assert!(s3
            .reserve_resources("s1_3", ResourceKind::Cpu, 0.2)
            .is_ok());
    }
}
