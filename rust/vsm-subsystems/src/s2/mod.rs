//! # S2 - Coordination
//!
//! Prevents oscillation between S1 units competing for shared resources.
//! Requests are classified by their resource requirements, checked
//! against active allocations and per-resource caps, and resolved by the
//! configured strategy on conflict. The conflict log feeds the
//! oscillation detector; detected patterns are answered with per-unit
//! dampening commands and forwarded to S4 for learning.

pub mod oscillation;

pub use oscillation::{
    ConflictRecord, DampeningCommand, OscillationClass, OscillationPattern, CONFLICT_RING,
    DETECTION_WINDOW_MS,
};

use crate::error::{Result, SubsystemError};
use crate::types::{HealthReport, Subsystem, HEALTH_INTERVAL_MS};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use vsm_channels::{VarietyChannel, VarietyPacket, VarietyType};
use vsm_core::{hlc, topics, EventBus, VsmLevel};

/// Conflict-resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Winner chosen by unit priority (default)
    PriorityBased,
    /// Contested amounts split 50/50
    Cooperative,
    /// Grant goes to the least recently granted unit
    RoundRobin,
}

/// S2 tuning knobs
#[derive(Debug, Clone)]
pub struct S2Config {
    /// Conflict-resolution strategy
    pub strategy: ResolutionStrategy,
    /// Per-resource utilization caps
    pub cpu_cap: f64,
    /// Memory cap
    pub memory_cap: f64,
    /// IO cap
    pub io_cap: f64,
    /// Network cap
    pub network_cap: f64,
    /// Delay suggested to a waiting unit
    pub wait_delay: Duration,
    /// Minimum spacing between dampening rounds for one pair
    pub dampen_cooldown: Duration,
}

impl Default for S2Config {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::PriorityBased,
            cpu_cap: 0.8,
            memory_cap: 0.8,
            io_cap: 0.5,
            network_cap: 0.5,
            wait_delay: Duration::from_millis(50),
            dampen_cooldown: Duration::from_secs(1),
        }
    }
}

/// Resource requirements classified from a request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU fraction in `[0, 1]`
    pub cpu: f64,
    /// Memory fraction
    pub memory: f64,
    /// IO fraction
    pub io: f64,
    /// Network fraction
    pub network: f64,
    /// Exclusive resource tag, if the request must hold it alone
    pub exclusive: Option<String>,
}

impl ResourceRequirements {
    fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("io", self.io),
            ("network", self.network),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(SubsystemError::InvalidInput(format!(
                    "{} requirement {} outside [0, 1]",
                    name, v
                )));
            }
        }
        Ok(())
    }

    fn scaled(&self, factor: f64) -> Self {
        Self {
            cpu: self.cpu * factor,
            memory: self.memory * factor,
            io: self.io * factor,
            network: self.network * factor,
            exclusive: self.exclusive.clone(),
        }
    }

    fn merge(&mut self, other: &Self) {
        self.cpu += other.cpu;
        self.memory += other.memory;
        self.io += other.io;
        self.network += other.network;
        if other.exclusive.is_some() {
            self.exclusive = other.exclusive.clone();
        }
    }
}

/// Outcome of `coordinate_request`
#[derive(Debug, Clone, Serialize)]
pub enum CoordinationOutcome {
    /// Resources granted (possibly clipped or split)
    Granted {
        /// What the unit may consume
        allocation: ResourceRequirements,
    },
    /// Back off and retry after the delay
    Wait {
        /// Suggested delay
        delay_ms: u64,
    },
}

/// Snapshot returned by `get_coordination_state`
#[derive(Debug, Clone, Serialize)]
pub struct CoordinationState {
    /// Units with live allocations
    pub active_allocations: HashMap<String, ResourceRequirements>,
    /// Conflicts currently in the ring
    pub conflict_count: usize,
    /// Granted over granted-plus-waited, from post-update counters
    pub efficiency: f64,
    /// Oscillations from the latest detection round
    pub oscillations: Vec<OscillationPattern>,
    /// Active strategy
    pub strategy: ResolutionStrategy,
}

/// The S2 coordination subsystem
pub struct Coordination {
    config: S2Config,
    bus: Arc<EventBus>,
    from_s1: Arc<VarietyChannel>,
    to_s3: Arc<VarietyChannel>,
    allocations: Mutex<HashMap<String, ResourceRequirements>>,
    exclusive_holders: Mutex<HashMap<String, String>>,
    conflicts: Mutex<VecDeque<ConflictRecord>>,
    last_grant: Mutex<HashMap<String, Instant>>,
    last_dampened: Mutex<HashMap<[String; 2], Instant>>,
    recent_patterns: Mutex<Vec<OscillationPattern>>,
    granted: AtomicU64,
    waited: AtomicU64,
}

impl Coordination {
    /// Create S2 with its inbound and outbound channels
    pub fn new(
        config: S2Config,
        bus: Arc<EventBus>,
        from_s1: Arc<VarietyChannel>,
        to_s3: Arc<VarietyChannel>,
    ) -> Self {
        Self {
            config,
            bus,
            from_s1,
            to_s3,
            allocations: Mutex::new(HashMap::new()),
            exclusive_holders: Mutex::new(HashMap::new()),
            conflicts: Mutex::new(VecDeque::new()),
            last_grant: Mutex::new(HashMap::new()),
            last_dampened: Mutex::new(HashMap::new()),
            recent_patterns: Mutex::new(Vec::new()),
            granted: AtomicU64::new(0),
            waited: AtomicU64::new(0),
        }
    }

    /// Coordinate one unit's resource request
    ///
    /// No conflict: allocate up to available and record the reservation.
    /// Conflict: log it and resolve by the configured strategy.
    #[instrument(skip(self, req), fields(unit = %unit))]
    pub fn coordinate_request(
        &self,
        unit: &str,
        req: ResourceRequirements,
    ) -> Result<CoordinationOutcome> {
        req.validate()?;

        let conflict = self.find_conflict(unit, &req);
        match conflict {
            None => {
                // Allocate up to available: a lone oversized request is
                // clipped at the caps rather than blowing through them
                let allocation = self.clipped(&req);
                self.allocate(unit, allocation.clone());
                self.granted.fetch_add(1, Ordering::Relaxed);
                self.bus.metrics().incr("s2.granted");
                Ok(CoordinationOutcome::Granted { allocation })
            }
            Some((other, resource, usage)) => {
                self.log_conflict(unit, &other, &resource, usage);
                let outcome = self.resolve(unit, &other, &req);
                if matches!(outcome, CoordinationOutcome::Wait { .. }) {
                    self.waited.fetch_add(1, Ordering::Relaxed);
                    self.bus.metrics().incr("s2.waited");
                } else {
                    self.granted.fetch_add(1, Ordering::Relaxed);
                    self.bus.metrics().incr("s2.granted");
                }
                self.detect_and_dampen();
                Ok(outcome)
            }
        }
    }

    /// Record a conflict observed outside `coordinate_request`
    pub fn report_conflict(&self, u1: &str, u2: &str, resource: &str) {
        let usage = self.current_usage(resource);
        self.log_conflict(u1, u2, resource, usage);
        self.detect_and_dampen();
    }

    /// Release a unit's allocation and exclusive holds
    pub fn release(&self, unit: &str) {
        self.allocations.lock().remove(unit);
        self.exclusive_holders
            .lock()
            .retain(|_, holder| holder != unit);
    }

    /// Current coordination snapshot
    ///
    /// Efficiency reads the post-update counters: grants and waits
    /// recorded before this call, in program order, are always included.
    pub fn get_coordination_state(&self) -> CoordinationState {
        let granted = self.granted.load(Ordering::Relaxed);
        let waited = self.waited.load(Ordering::Relaxed);
        let total = granted + waited;
        CoordinationState {
            active_allocations: self.allocations.lock().clone(),
            conflict_count: self.conflicts.lock().len(),
            efficiency: if total == 0 {
                1.0
            } else {
                granted as f64 / total as f64
            },
            oscillations: self.recent_patterns.lock().clone(),
            strategy: self.config.strategy,
        }
    }

    fn find_conflict(
        &self,
        unit: &str,
        req: &ResourceRequirements,
    ) -> Option<(String, String, f64)> {
        if let Some(tag) = &req.exclusive {
            let holders = self.exclusive_holders.lock();
            if let Some(holder) = holders.get(tag) {
                if holder != unit {
                    return Some((holder.clone(), tag.clone(), 1.0));
                }
            }
        }

        let allocations = self.allocations.lock();
        let checks = [
            ("cpu", req.cpu, self.config.cpu_cap),
            ("memory", req.memory, self.config.memory_cap),
            ("io", req.io, self.config.io_cap),
            ("network", req.network, self.config.network_cap),
        ];

        for (resource, requested, cap) in checks {
            if requested == 0.0 {
                continue;
            }
            let total: f64 = allocations.values().map(|a| component(a, resource)).sum();
            if total + requested > cap {
                // Conflict is attributed to the largest current holder
                let other = allocations
                    .iter()
                    .filter(|(u, _)| u.as_str() != unit)
                    .max_by(|(_, a), (_, b)| {
                        component(a, resource).total_cmp(&component(b, resource))
                    })
                    .map(|(u, _)| u.clone())?;
                return Some((other, resource.to_string(), (total + requested).min(1.0)));
            }
        }
        None
    }

    fn allocate(&self, unit: &str, req: ResourceRequirements) {
        if let Some(tag) = &req.exclusive {
            self.exclusive_holders
                .lock()
                .insert(tag.clone(), unit.to_string());
        }
        self.allocations
            .lock()
            .entry(unit.to_string())
            .or_default()
            .merge(&req);
        self.last_grant
            .lock()
            .insert(unit.to_string(), Instant::now());
    }

    fn resolve(&self, unit: &str, other: &str, req: &ResourceRequirements) -> CoordinationOutcome {
        let wait = CoordinationOutcome::Wait {
            delay_ms: self.config.wait_delay.as_millis() as u64,
        };

        match self.config.strategy {
            ResolutionStrategy::PriorityBased => {
                if priority_wins(unit, other) {
                    let allocation = self.clipped(req);
                    self.allocate(unit, allocation.clone());
                    CoordinationOutcome::Granted { allocation }
                } else {
                    wait
                }
            }
            ResolutionStrategy::Cooperative => {
                let allocation = req.scaled(0.5);
                self.allocate(unit, allocation.clone());
                CoordinationOutcome::Granted { allocation }
            }
            ResolutionStrategy::RoundRobin => {
                let grants = self.last_grant.lock();
                let mine = grants.get(unit);
                let theirs = grants.get(other);
                let i_am_older = match (mine, theirs) {
                    (None, _) => true,
                    (Some(_), None) => false,
                    (Some(m), Some(t)) => m < t,
                };
                drop(grants);
                if i_am_older {
                    let allocation = self.clipped(req);
                    self.allocate(unit, allocation.clone());
                    CoordinationOutcome::Granted { allocation }
                } else {
                    wait
                }
            }
        }
    }

    /// Clip a request to what remains under each cap
    fn clipped(&self, req: &ResourceRequirements) -> ResourceRequirements {
        let allocations = self.allocations.lock();
        let remaining = |resource: &str, cap: f64| {
            let total: f64 = allocations.values().map(|a| component(a, resource)).sum();
            (cap - total).max(0.0)
        };
        ResourceRequirements {
            cpu: req.cpu.min(remaining("cpu", self.config.cpu_cap)),
            memory: req.memory.min(remaining("memory", self.config.memory_cap)),
            io: req.io.min(remaining("io", self.config.io_cap)),
            network: req.network.min(remaining("network", self.config.network_cap)),
            exclusive: req.exclusive.clone(),
        }
    }

    fn current_usage(&self, resource: &str) -> f64 {
        let allocations = self.allocations.lock();
        let total: f64 = allocations.values().map(|a| component(a, resource)).sum();
        if total > 0.0 {
            total.min(1.0)
        } else {
            // No allocation data: assume the cap midpoint
            self.cap_of(resource) / 2.0
        }
    }

    fn cap_of(&self, resource: &str) -> f64 {
        match resource {
            "cpu" => self.config.cpu_cap,
            "memory" => self.config.memory_cap,
            "io" => self.config.io_cap,
            "network" => self.config.network_cap,
            _ => 1.0,
        }
    }

    fn log_conflict(&self, u1: &str, u2: &str, resource: &str, usage: f64) {
        let record = ConflictRecord::new(u1, u2, resource, hlc::wall_ms(), usage);
        let mut conflicts = self.conflicts.lock();
        if conflicts.len() >= CONFLICT_RING {
            conflicts.pop_front();
        }
        conflicts.push_back(record);
        self.bus.metrics().incr("s2.conflicts");
    }

    /// Run detection over the ring and dampen fresh oscillations
    pub fn detect_and_dampen(&self) {
        let patterns = {
            let conflicts = self.conflicts.lock();
            oscillation::detect(conflicts.iter(), hlc::wall_ms())
        };

        for pattern in &patterns {
            {
                let mut dampened = self.last_dampened.lock();
                let now = Instant::now();
                if let Some(at) = dampened.get(&pattern.units) {
                    if now.duration_since(*at) < self.config.dampen_cooldown {
                        continue;
                    }
                }
                dampened.insert(pattern.units.clone(), now);
            }

            warn!(
                units = ?pattern.units,
                class = %pattern.class,
                frequency_hz = pattern.frequency_hz,
                severity = pattern.severity,
                "oscillation detected, dampening"
            );
            self.bus.metrics().incr("s2.oscillations");

            let total = pattern.units.len();
            for (i, unit) in pattern.units.iter().enumerate() {
                let command = oscillation::dampening_for(pattern, i, total);
                let mut data = serde_json::to_value(&command).unwrap_or_default();
                if let Some(obj) = data.as_object_mut() {
                    obj.insert("command".to_string(), serde_json::json!("dampen"));
                    obj.insert("unit_id".to_string(), serde_json::json!(unit));
                }
                let _ = self
                    .bus
                    .publish_critical(&topics::unit_control(unit), "s2", data);
            }

            // Forward the pattern to S4 for learning
            let _ = self.bus.publish_critical(
                topics::S2_PATTERN_DETECTED,
                "s2",
                serde_json::to_value(pattern).unwrap_or_default(),
            );
        }

        *self.recent_patterns.lock() = patterns;
    }

    /// Absorb operational variety from S1 and pass summaries to S3
    fn pump_variety(&self) {
        let mut absorbed = 0usize;
        let mut patterns: Vec<String> = Vec::new();
        while let Some(packet) = self.from_s1.try_receive() {
            absorbed += 1;
            patterns.extend(packet.patterns);
        }
        if absorbed == 0 {
            return;
        }

        if let Ok(ts) = self.bus.clock().tick() {
            let packet = VarietyPacket::new(
                VarietyType::Coordinated,
                absorbed,
                patterns,
                serde_json::json!({ "absorbed": absorbed }),
                ts,
            );
            let _ = self.to_s3.transmit(packet);
        }
    }

    fn health_report(&self) -> HealthReport {
        let conflict_pressure = (self.conflicts.lock().len() as f64 / CONFLICT_RING as f64).min(1.0);
        let oscillation_pressure =
            (self.recent_patterns.lock().len() as f64 * 0.2).min(1.0);
        let health = (1.0 - (0.5 * conflict_pressure + 0.5 * oscillation_pressure)).clamp(0.0, 1.0);

        HealthReport {
            health,
            error_rate: 0.0,
            response_time_ms: 0.0,
            queue_depth: self.conflicts.lock().len() as f64,
            throughput: self.granted.load(Ordering::Relaxed) as f64,
        }
    }

    fn health_tick(&self) {
        self.pump_variety();
        self.detect_and_dampen();

        let report = self.health_report();
        if let Err(e) = self.bus.publish(
            topics::S2_HEALTH,
            "s2",
            serde_json::to_value(&report).unwrap_or_default(),
        ) {
            warn!(error = %e, "s2 health publish failed");
        }
    }
}

fn component(req: &ResourceRequirements, resource: &str) -> f64 {
    match resource {
        "cpu" => req.cpu,
        "memory" => req.memory,
        "io" => req.io,
        "network" => req.network,
        _ => 0.0,
    }
}

/// Winner of a priority contest: lexicographic compare of the digits in
/// the unit ids, falling back to alphabetical order
fn priority_wins(unit: &str, other: &str) -> bool {
    let digits = |s: &str| s.chars().filter(|c| c.is_ascii_digit()).collect::<String>();
    let (a, b) = (digits(unit), digits(other));
    if a != b {
        a < b
    } else {
        unit < other
    }
}

#[async_trait]
impl Subsystem for Coordination {
    fn level(&self) -> VsmLevel {
        VsmLevel::S2
    }

    async fn health(&self) -> f64 {
        self.health_report().health
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut operations = self.bus.subscribe(topics::S1_OPERATIONS)?;
        let mut ticker = tokio::time::interval(Duration::from_millis(HEALTH_INTERVAL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(strategy = ?self.config.strategy, "s2 coordination running");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.health_tick(),
                event = operations.recv() => {
                    match event {
                        Some(event) => {
                            // Operational telemetry keeps the allocation
                            // picture warm even without explicit requests
                            debug!(unit = ?event.data.get("unit_id"), "s1 operations observed");
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
        info!("s2 coordination stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsm_channels::ChannelKind;
    use vsm_core::{HybridLogicalClock, MetricsRegistry};

    fn s2() -> (Coordination, Arc<EventBus>) {
        let clock = Arc::new(HybridLogicalClock::new("s2-test"));
        let bus = Arc::new(EventBus::new(clock, Arc::new(MetricsRegistry::new())));
        let from_s1 = Arc::new(VarietyChannel::new(ChannelKind::S1ToS2, Arc::clone(&bus)));
        let to_s3 = Arc::new(VarietyChannel::new(ChannelKind::S2ToS3, Arc::clone(&bus)));
        (
            Coordination::new(S2Config::default(), Arc::clone(&bus), from_s1, to_s3),
            bus,
        )
    }

    fn cpu(amount: f64) -> ResourceRequirements {
        ResourceRequirements {
            cpu: amount,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_non_conflicting_requests_are_granted() {
        let (s2, _bus) = s2();
        let outcome = s2.coordinate_request("s1_1", cpu(0.3)).unwrap();
        assert!(matches!(outcome, CoordinationOutcome::Granted { .. }));

        let state = s2.get_coordination_state();
        assert_eq!(state.active_allocations.len(), 1);
        assert_eq!(state.efficiency, 1.0);
    }

    #[tokio::test]
    async fn test_cpu_cap_produces_conflict_and_priority_ruling() {
        let (s2, _bus) = s2();
        s2.coordinate_request("s1_2", cpu(0.6)).unwrap();

        // s1_1 outranks s1_2 (lower digit string), so it wins the contest
        let outcome = s2.coordinate_request("s1_1", cpu(0.5)).unwrap();
        match outcome {
            CoordinationOutcome::Granted { allocation } => {
                // Clipped to what the 0.8 cap leaves available
                assert!((allocation.cpu - 0.2).abs() < 1e-9);
            }
            other => panic!("expected clipped grant, got {:?}", other),
        }

        // The lower-priority unit waits instead
        let outcome = s2.coordinate_request("s1_9", cpu(0.5)).unwrap();
        assert!(matches!(outcome, CoordinationOutcome::Wait { delay_ms: 50 }));
    }

    #[tokio::test]
    async fn test_exclusive_collision_conflicts() {
        let (s2, _bus) = s2();
        let exclusive = ResourceRequirements {
            exclusive: Some("gpu".to_string()),
            ..Default::default()
        };
        s2.coordinate_request("s1_1", exclusive.clone()).unwrap();

        let outcome = s2.coordinate_request("s1_2", exclusive).unwrap();
        assert!(matches!(outcome, CoordinationOutcome::Wait { .. }));
        assert_eq!(s2.get_coordination_state().conflict_count, 1);
    }

    #[tokio::test]
    async fn test_cooperative_strategy_splits() {
        let clock = Arc::new(HybridLogicalClock::new("s2-coop"));
        let bus = Arc::new(EventBus::new(clock, Arc::new(MetricsRegistry::new())));
        let from_s1 = Arc::new(VarietyChannel::new(ChannelKind::S1ToS2, Arc::clone(&bus)));
        let to_s3 = Arc::new(VarietyChannel::new(ChannelKind::S2ToS3, Arc::clone(&bus)));
        let s2 = Coordination::new(
            S2Config {
                strategy: ResolutionStrategy::Cooperative,
                ..Default::default()
            },
            bus,
            from_s1,
            to_s3,
        );

        s2.coordinate_request("s1_1", cpu(0.6)).unwrap();
        let outcome = s2.coordinate_request("s1_2", cpu(0.6)).unwrap();
        match outcome {
            CoordinationOutcome::Granted { allocation } => {
                assert!((allocation.cpu - 0.3).abs() < 1e-9);
            }
            other => panic!("expected split grant, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_returns_capacity() {
        let (s2, _bus) = s2();
        s2.coordinate_request("s1_1", cpu(0.7)).unwrap();
        assert!(matches!(
            s2.coordinate_request("s1_9", cpu(0.5)).unwrap(),
            CoordinationOutcome::Wait { .. }
        ));

        s2.release("s1_1");
        assert!(matches!(
            s2.coordinate_request("s1_9", cpu(0.5)).unwrap(),
            CoordinationOutcome::Granted { .. }
        ));
    }

    #[tokio::test]
    async fn test_reported_conflicts_dampen_within_the_tick() {
        let (s2, bus) = s2();
        let mut unit1 = bus.subscribe(&topics::unit_control("s1_1")).unwrap();
        let mut unit2 = bus.subscribe(&topics::unit_control("s1_2")).unwrap();
        let mut learned = bus.subscribe(topics::S2_PATTERN_DETECTED).unwrap();

        // Three regular conflicts 200 ms apart read as ~5 Hz resonance
        for _ in 0..3 {
            s2.report_conflict("s1_1", "s1_2", "cpu");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let cmd1 = unit1.recv().await.unwrap();
        assert_eq!(cmd1.data["command"], "dampen");
        assert_eq!(cmd1.data["strategy"], "phase_shift");
        assert!(cmd1.data["offset_rad"].as_f64().unwrap().abs() < 1e-9);

        let cmd2 = unit2.recv().await.unwrap();
        let offset = cmd2.data["offset_rad"].as_f64().unwrap();
        assert!((offset - std::f64::consts::PI).abs() < 1e-6);

        let pattern = learned.recv().await.unwrap();
        assert_eq!(pattern.data["class"], "resonance");
    }

    #[tokio::test]
    async fn test_efficiency_reads_post_update_counters() {
        let (s2, _bus) = s2();
        s2.coordinate_request("s1_1", cpu(0.7)).unwrap();
        s2.coordinate_request("s1_9", cpu(0.7)).unwrap(); // waits

        let state = s2.get_coordination_state();
        assert!((state.efficiency - 0.5).abs() < 1e-9);
    }
}
