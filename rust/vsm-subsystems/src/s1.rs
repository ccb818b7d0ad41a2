//! # S1 - Operations
//!
//! Executes units of work through a registry of handlers. Each unit
//! reports its load, held resources, and throughput; the subsystem as a
//! whole reports health every second and feeds operational variety into
//! the S1→S2 channel.
//!
//! Admission is guarded per request by the shared rate limiter and a
//! circuit breaker; the backlog is bounded and drops the newest request
//! (with pain) when full. Control modes change only in response to
//! `s3_control` messages or emergency algedonic broadcasts.

use crate::error::{Result, SubsystemError};
use crate::types::{ControlMode, HealthReport, Subsystem, HEALTH_INTERVAL_MS};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vsm_channels::{Severity, Signal, VarietyChannel, VarietyPacket, VarietyType};
use vsm_core::{topics, EventBus, VsmLevel};
use vsm_resilience::{BucketScope, CircuitBreaker, CircuitBreakerConfig, RateLimiter, ResilienceError};

/// Work handler resolved from the request kind
pub type WorkHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// S1 tuning knobs
#[derive(Debug, Clone)]
pub struct S1Config {
    /// Number of operational units
    pub units: usize,
    /// Queued requests allowed before drop-newest
    pub backlog_limit: usize,
    /// Latency objective used in health scoring
    pub slo_ms: f64,
    /// Per-request deadline (waiting for a unit included)
    pub request_timeout: Duration,
    /// Breaker wrapping handler execution
    pub breaker: CircuitBreakerConfig,
    /// Pain threshold mirrored from the algedonic configuration
    pub pain_threshold: f64,
}

impl Default for S1Config {
    fn default() -> Self {
        Self {
            units: 4,
            backlog_limit: 256,
            slo_ms: 250.0,
            request_timeout: Duration::from_secs(5),
            breaker: CircuitBreakerConfig::default(),
            pain_threshold: 0.85,
        }
    }
}

/// One unit of work submitted to S1
#[derive(Debug, Clone)]
pub struct WorkRequest {
    /// Request id
    pub id: Uuid,
    /// Handler key
    pub kind: String,
    /// Handler input
    pub payload: serde_json::Value,
    /// Token cost charged against the S1 bucket
    pub cost: f64,
}

impl WorkRequest {
    /// Build a request with unit token cost
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            cost: 1.0,
        }
    }
}

/// Completed work
#[derive(Debug, Clone, Serialize)]
pub struct WorkResponse {
    /// Request id
    pub request_id: Uuid,
    /// Unit that executed it
    pub unit_id: String,
    /// Handler output
    pub output: serde_json::Value,
    /// Wall time spent
    pub duration_ms: f64,
}

#[derive(Debug)]
struct UnitState {
    unit_id: String,
    control_mode: ControlMode,
    resources_held: HashMap<String, f64>,
    processed: u64,
    errors: u64,
    in_flight: usize,
    recent_latency_ms: VecDeque<f64>,
    recent_outcomes: VecDeque<bool>,
}

impl UnitState {
    fn new(unit_id: String) -> Self {
        Self {
            unit_id,
            control_mode: ControlMode::Normal,
            resources_held: HashMap::new(),
            processed: 0,
            errors: 0,
            in_flight: 0,
            recent_latency_ms: VecDeque::new(),
            recent_outcomes: VecDeque::new(),
        }
    }

    fn record(&mut self, latency_ms: f64, ok: bool) {
        self.processed += 1;
        if !ok {
            self.errors += 1;
        }
        push_bounded(&mut self.recent_latency_ms, latency_ms, 100);
        push_bounded(&mut self.recent_outcomes, ok, 100);
    }

    fn load(&self) -> f64 {
        self.in_flight as f64
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, value: T, cap: usize) {
    if ring.len() >= cap {
        ring.pop_front();
    }
    ring.push_back(value);
}

/// Snapshot of one unit, as reported by [`Operations::get_state`]
#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    /// Unit id
    pub unit_id: String,
    /// In-flight work on this unit
    pub load: f64,
    /// Resources currently held
    pub resources_held: HashMap<String, f64>,
    /// Active control mode
    pub control_mode: ControlMode,
    /// Requests completed
    pub processed: u64,
}

/// Snapshot of S1 as a whole
#[derive(Debug, Clone, Serialize)]
pub struct S1State {
    /// Per-unit snapshots
    pub units: Vec<UnitSnapshot>,
    /// Requests currently waiting for a unit
    pub backlog: usize,
    /// Health as of the last tick
    pub health: f64,
}

/// The S1 operations subsystem
pub struct Operations {
    config: S1Config,
    bus: Arc<EventBus>,
    to_s2: Arc<VarietyChannel>,
    limiter: Arc<RateLimiter>,
    breaker: CircuitBreaker,
    handlers: DashMap<String, WorkHandler>,
    units: Vec<Mutex<UnitState>>,
    unit_permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    next_unit: AtomicUsize,
    started_at: Mutex<Instant>,
}

impl Operations {
    /// Create S1 with its upward channel and the shared limiter
    pub fn new(
        config: S1Config,
        bus: Arc<EventBus>,
        to_s2: Arc<VarietyChannel>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let units = (1..=config.units.max(1))
            .map(|i| Mutex::new(UnitState::new(format!("s1_{}", i))))
            .collect::<Vec<_>>();

        Self {
            breaker: CircuitBreaker::new("s1_operations", config.breaker.clone())
                .with_bus(Arc::clone(&bus)),
            unit_permits: Arc::new(Semaphore::new(units.len())),
            units,
            handlers: DashMap::new(),
            waiting: AtomicUsize::new(0),
            next_unit: AtomicUsize::new(0),
            started_at: Mutex::new(Instant::now()),
            config,
            bus,
            to_s2,
            limiter,
        }
    }

    /// Register a work handler for a request kind
    pub fn register_handler(&self, kind: impl Into<String>, handler: WorkHandler) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Execute one request
    ///
    /// Admission order: control mode, rate limiter, backlog bound, unit
    /// checkout, then the breaker-wrapped handler. Rejections are counted
    /// and, where severe, produce pain.
    #[instrument(skip(self, req), fields(kind = %req.kind, id = %req.id))]
    pub async fn process_request(&self, req: WorkRequest) -> Result<WorkResponse> {
        let cost = match self.mode() {
            ControlMode::EmergencyStop => {
                self.bus.metrics().incr("s1.rejected_emergency");
                return Err(SubsystemError::Unavailable {
                    subsystem: "s1".to_string(),
                    reason: "emergency stop active".to_string(),
                });
            }
            // Throttled mode charges double, halving effective rate
            ControlMode::Throttled => req.cost * 2.0,
            ControlMode::Normal => req.cost,
        };

        self.limiter
            .consume(&BucketScope::Subsystem(VsmLevel::S1), cost)
            .map_err(|e| {
                self.bus.metrics().incr("s1.rate_limited");
                SubsystemError::Resilience(e)
            })?;

        if self.waiting.load(Ordering::Acquire) >= self.config.backlog_limit {
            // Bounded backlog: the newest request is the one dropped
            self.bus.metrics().incr("s1.backlog_dropped");
            self.emit_pain("backlog", 0.9);
            return Err(SubsystemError::Overflow("s1 backlog full".to_string()));
        }

        self.waiting.fetch_add(1, Ordering::AcqRel);
        let permit = tokio::time::timeout(
            self.config.request_timeout,
            Arc::clone(&self.unit_permits).acquire_owned(),
        )
        .await;
        self.waiting.fetch_sub(1, Ordering::AcqRel);

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(SubsystemError::Unavailable {
                    subsystem: "s1".to_string(),
                    reason: "unit pool closed".to_string(),
                })
            }
            Err(_) => {
                self.bus.metrics().incr("s1.timeouts");
                return Err(SubsystemError::Timeout(self.config.request_timeout));
            }
        };

        let idx = self.next_unit.fetch_add(1, Ordering::Relaxed) % self.units.len();
        let unit_id = {
            let mut unit = self.units[idx].lock();
            unit.in_flight += 1;
            unit.unit_id.clone()
        };

        let handler = self
            .handlers
            .get(&req.kind)
            .map(|h| Arc::clone(&h))
            .unwrap_or_else(|| echo_handler());

        let payload = req.payload.clone();
        let started = Instant::now();
        let outcome = self
            .breaker
            .call(move || async move { handler(payload).await })
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut unit = self.units[idx].lock();
            unit.in_flight -= 1;
            unit.record(duration_ms, outcome.is_ok());
        }
        drop(permit);

        self.bus.metrics().observe("s1.request_ms", duration_ms);
        match outcome {
            Ok(output) => {
                self.bus.metrics().incr("s1.processed");
                Ok(WorkResponse {
                    request_id: req.id,
                    unit_id,
                    output,
                    duration_ms,
                })
            }
            Err(vsm_resilience::CallError::CircuitOpen) => {
                self.bus.metrics().incr("s1.circuit_rejected");
                Err(SubsystemError::Resilience(ResilienceError::CircuitOpen {
                    name: "s1_operations".to_string(),
                }))
            }
            Err(vsm_resilience::CallError::Timeout(d)) => {
                self.bus.metrics().incr("s1.timeouts");
                Err(SubsystemError::Timeout(d))
            }
            Err(vsm_resilience::CallError::Inner(e)) => {
                self.bus.metrics().incr("s1.failed");
                Err(e)
            }
        }
    }

    /// Current subsystem-wide control mode (most severe unit mode wins)
    pub fn mode(&self) -> ControlMode {
        let mut mode = ControlMode::Normal;
        for unit in &self.units {
            match unit.lock().control_mode {
                ControlMode::EmergencyStop => return ControlMode::EmergencyStop,
                ControlMode::Throttled => mode = ControlMode::Throttled,
                ControlMode::Normal => {}
            }
        }
        mode
    }

    /// Throttle every unit (algedonic- or S3-driven)
    pub fn throttle(&self) {
        self.set_mode_all(ControlMode::Throttled);
    }

    /// Hard-stop every unit
    pub fn emergency_stop(&self) {
        self.set_mode_all(ControlMode::EmergencyStop);
    }

    /// Return every unit to normal operation
    pub fn resume(&self) {
        self.set_mode_all(ControlMode::Normal);
    }

    fn set_mode_all(&self, mode: ControlMode) {
        for unit in &self.units {
            unit.lock().control_mode = mode;
        }
        info!(?mode, "s1 control mode set");
        self.bus
            .metrics()
            .set_gauge("s1.emergency_stop", (mode == ControlMode::EmergencyStop) as u8 as f64);
    }

    /// Apply one control command (from `s3_control` or a unit channel)
    pub fn apply_control(&self, data: &serde_json::Value) {
        let Some(command) = data.get("command").and_then(|c| c.as_str()) else {
            return;
        };
        let target = data.get("unit_id").and_then(|u| u.as_str());

        match command {
            "throttle" => self.apply_mode(target, ControlMode::Throttled),
            "emergency_stop" => self.apply_mode(target, ControlMode::EmergencyStop),
            "resume" => self.apply_mode(target, ControlMode::Normal),
            "dampen" => {
                // Dampening directives arrive per unit from S2; honoring
                // them means running that unit throttled for the burst
                self.apply_mode(target, ControlMode::Throttled);
                self.bus.metrics().incr("s1.dampening_applied");
            }
            other => debug!(command = other, "ignoring unknown control command"),
        }
    }

    fn apply_mode(&self, target: Option<&str>, mode: ControlMode) {
        match target {
            None => self.set_mode_all(mode),
            Some(unit_id) => {
                for unit in &self.units {
                    let mut unit = unit.lock();
                    if unit.unit_id == unit_id {
                        unit.control_mode = mode;
                        return;
                    }
                }
                warn!(unit_id, "control command for unknown unit");
            }
        }
    }

    /// Current state snapshot
    pub fn get_state(&self) -> S1State {
        let units: Vec<UnitSnapshot> = self
            .units
            .iter()
            .map(|u| {
                let u = u.lock();
                UnitSnapshot {
                    unit_id: u.unit_id.clone(),
                    load: u.load(),
                    resources_held: u.resources_held.clone(),
                    control_mode: u.control_mode,
                    processed: u.processed,
                }
            })
            .collect();

        S1State {
            backlog: self.waiting.load(Ordering::Acquire),
            health: self.health_report().health,
            units,
        }
    }

    fn health_report(&self) -> HealthReport {
        let mut latencies = Vec::new();
        let mut outcomes = 0usize;
        let mut failures = 0usize;
        let mut in_flight = 0usize;
        let mut processed = 0u64;

        for unit in &self.units {
            let unit = unit.lock();
            latencies.extend(unit.recent_latency_ms.iter().copied());
            outcomes += unit.recent_outcomes.len();
            failures += unit.recent_outcomes.iter().filter(|ok| !**ok).count();
            in_flight += unit.in_flight;
            processed += unit.processed;
        }

        let error_rate = if outcomes == 0 {
            0.0
        } else {
            failures as f64 / outcomes as f64
        };
        let response_time_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        let backlog = self.waiting.load(Ordering::Acquire) as f64;
        let uptime = self.started_at.lock().elapsed().as_secs_f64().max(1.0);

        let latency_pressure = (response_time_ms / self.config.slo_ms).min(1.0);
        let load_pressure = (in_flight as f64 / self.units.len() as f64).min(1.0);
        let backlog_pressure = (backlog / self.config.backlog_limit as f64).min(1.0);
        let health = (1.0
            - (0.4 * error_rate
                + 0.3 * latency_pressure
                + 0.2 * load_pressure
                + 0.1 * backlog_pressure))
            .clamp(0.0, 1.0);

        HealthReport {
            health,
            error_rate,
            response_time_ms,
            queue_depth: backlog,
            throughput: processed as f64 / uptime,
        }
    }

    fn health_tick(&self) {
        let report = self.health_report();
        let payload = serde_json::to_value(&report).unwrap_or_default();
        if let Err(e) = self.bus.publish(topics::S1_HEALTH, "s1", payload) {
            warn!(error = %e, "s1 health publish failed");
        }

        // Operational variety and per-unit telemetry upward
        for unit in &self.units {
            let unit = unit.lock();
            let patterns: Vec<String> = unit
                .resources_held
                .keys()
                .map(|r| format!("holding:{}", r))
                .collect();
            let data = serde_json::json!({
                "unit_id": unit.unit_id,
                "load": unit.load(),
                "resources": unit.resources_held,
                "patterns": patterns,
            });
            drop(unit);

            let _ = self.bus.publish(topics::S1_OPERATIONS, "s1", data.clone());
            if let Ok(ts) = self.bus.clock().tick() {
                let _ = self.to_s2.transmit(VarietyPacket::new(
                    VarietyType::Operational,
                    1,
                    Vec::new(),
                    data,
                    ts,
                ));
            }
        }

        if report.health < 1.0 - self.config.pain_threshold {
            self.emit_pain("s1_health", 1.0 - report.health);
        }
    }

    fn emit_pain(&self, metric: &str, intensity: f64) {
        let signal = Signal::new(
            "s1",
            metric,
            intensity,
            Severity::Warning,
            self.bus.clock().tick_or_fallback(),
        );
        let _ = self.bus.publish_critical(
            topics::ALGEDONIC_PAIN,
            "s1",
            serde_json::to_value(&signal).unwrap_or_default(),
        );
    }
}

fn echo_handler() -> WorkHandler {
    Arc::new(|payload| Box::pin(async move { Ok(payload) }))
}

#[async_trait]
impl Subsystem for Operations {
    fn level(&self) -> VsmLevel {
        VsmLevel::S1
    }

    async fn health(&self) -> f64 {
        self.health_report().health
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut control = self.bus.subscribe(topics::S3_CONTROL)?;
        let mut broadcast = self.bus.subscribe(topics::ALL_SUBSYSTEMS)?;
        let mut unit_controls = Vec::new();
        for unit in &self.units {
            let unit_id = unit.lock().unit_id.clone();
            unit_controls.push(self.bus.subscribe(&topics::unit_control(&unit_id))?);
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(HEALTH_INTERVAL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(units = self.units.len(), "s1 operations running");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.health_tick();
                    // Per-unit dampening commands arrive on their own topics
                    for sub in unit_controls.iter_mut() {
                        while let Some(event) = sub.try_recv() {
                            self.apply_control(&event.data);
                        }
                    }
                }
                event = control.recv() => {
                    match event {
                        Some(event) => self.apply_control(&event.data),
                        None => break,
                    }
                }
                event = broadcast.recv() => {
                    if let Some(event) = event {
                        if event.data.get("emergency_mode").and_then(|v| v.as_bool()) == Some(true) {
                            warn!("s1 received emergency broadcast, stopping units");
                            self.emergency_stop();
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
        info!("s1 operations stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsm_channels::ChannelKind;
    use vsm_core::{HybridLogicalClock, MetricsRegistry};
    use vsm_resilience::RateLimiterConfig;

    fn s1() -> (Arc<Operations>, Arc<EventBus>) {
        let clock = Arc::new(HybridLogicalClock::new("s1-test"));
        let bus = Arc::new(EventBus::new(clock, Arc::new(MetricsRegistry::new())));
        let channel = Arc::new(VarietyChannel::new(ChannelKind::S1ToS2, Arc::clone(&bus)));
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
        let ops = Arc::new(Operations::new(
            S1Config::default(),
            Arc::clone(&bus),
            channel,
            limiter,
        ));
        (ops, bus)
    }

    #[tokio::test]
    async fn test_request_round_trips_through_a_unit() {
        let (ops, _bus) = s1();
        let resp = ops
            .process_request(WorkRequest::new("echo", serde_json::json!({ "n": 7 })))
            .await
            .unwrap();
        assert_eq!(resp.output["n"], 7);
        assert!(resp.unit_id.starts_with("s1_"));
    }

    #[tokio::test]
    async fn test_registered_handler_is_used() {
        let (ops, _bus) = s1();
        ops.register_handler(
            "double",
            Arc::new(|payload| {
                Box::pin(async move {
                    let n = payload["n"].as_i64().unwrap_or(0);
                    Ok(serde_json::json!({ "n": n * 2 }))
                })
            }),
        );

        let resp = ops
            .process_request(WorkRequest::new("double", serde_json::json!({ "n": 21 })))
            .await
            .unwrap();
        assert_eq!(resp.output["n"], 42);
    }

    #[tokio::test]
    async fn test_emergency_stop_rejects_work() {
        let (ops, _bus) = s1();
        ops.emergency_stop();

        let result = ops
            .process_request(WorkRequest::new("echo", serde_json::json!({})))
            .await;
        assert!(matches!(result, Err(SubsystemError::Unavailable { .. })));

        ops.resume();
        assert!(ops
            .process_request(WorkRequest::new("echo", serde_json::json!({})))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_control_commands_target_single_units() {
        let (ops, _bus) = s1();
        ops.apply_control(&serde_json::json!({ "command": "throttle", "unit_id": "s1_2" }));

        let state = ops.get_state();
        let modes: Vec<ControlMode> = state.units.iter().map(|u| u.control_mode).collect();
        assert_eq!(modes.iter().filter(|m| **m == ControlMode::Throttled).count(), 1);
        assert_eq!(ops.mode(), ControlMode::Throttled);
    }

    #[tokio::test]
    async fn test_health_starts_high_and_degrades_with_failures() {
        let (ops, _bus) = s1();
        assert!(ops.health().await > 0.9);

        ops.register_handler(
            "fail",
            Arc::new(|_| {
                Box::pin(async move {
                    Err(SubsystemError::InvalidInput("always fails".to_string()))
                })
            }),
        );
        for _ in 0..10 {
            let _ = ops
                .process_request(WorkRequest::new("fail", serde_json::json!({})))
                .await;
        }
        assert!(ops.health().await < 0.9);
    }

    #[tokio::test]
    async fn test_health_tick_emits_operational_variety() {
        let (ops, bus) = s1();
        let mut health = bus.subscribe(topics::S1_HEALTH).unwrap();
        let mut operations = bus.subscribe(topics::S1_OPERATIONS).unwrap();

        ops.health_tick();

        let event = health.recv().await.unwrap();
        assert!(event.data["health"].as_f64().unwrap() > 0.0);
        let op = operations.recv().await.unwrap();
        assert!(op.data["unit_id"].as_str().unwrap().starts_with("s1_"));
    }
}
