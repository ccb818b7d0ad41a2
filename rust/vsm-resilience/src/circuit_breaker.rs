//! # Circuit Breaker
//!
//! Classic three-state breaker guarding every outbound call the runtime
//! makes: `closed → open → half_open → closed/open`. Timeouts count as
//! failures. While open, the wrapped function is never invoked; after the
//! recovery window a bounded number of half-open probes decide whether the
//! circuit closes again.
//!
//! State transitions are serialized behind one lock; the wrapped future
//! itself runs outside it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vsm_resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new("upstream", CircuitBreakerConfig::default());
//! let result: Result<u32, _> = breaker.call(|| async { Ok::<_, String>(42) }).await;
//! assert_eq!(result.unwrap(), 42);
//! # }
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vsm_core::{topics, EventBus};

/// Breaker tuning knobs
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `closed` before opening
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    pub recovery_time: Duration,
    /// Per-call deadline; exceeding it counts as a failure
    pub timeout: Duration,
    /// Concurrent probes allowed in `half_open`
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            half_open_max: 1,
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through; failures are counted
    Closed,
    /// Calls are rejected without running
    Open,
    /// A bounded number of probes test recovery
    HalfOpen,
}

/// Error returned by [`CircuitBreaker::call`]
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// Circuit is open; the wrapped function was not invoked
    #[error("circuit open")]
    CircuitOpen,
    /// The wrapped function exceeded the configured timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The wrapped function itself failed
    #[error("inner error: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

enum Permit {
    Normal,
    Probe,
}

/// Task-safe circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    bus: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    /// Create a breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                probes_in_flight: 0,
            }),
            bus: None,
        }
    }

    /// Attach a bus for `circuit_breaker_opened` / `circuit_breaker_closed`
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (resolves `open → half_open` lazily)
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_enter_half_open(&mut inner);
        inner.state
    }

    /// Current consecutive-failure count
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Run `f` through the breaker
    ///
    /// In `open`, returns `CallError::CircuitOpen` without invoking `f`.
    /// Timeouts count as failures.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().ok_or(CallError::CircuitOpen)?;

        match tokio::time::timeout(self.config.timeout, f()).await {
            Ok(Ok(value)) => {
                self.on_success(&permit);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(&permit);
                Err(CallError::Inner(e))
            }
            Err(_) => {
                self.on_failure(&permit);
                Err(CallError::Timeout(self.config.timeout))
            }
        }
    }

    fn try_acquire(&self) -> Option<Permit> {
        let mut inner = self.inner.lock();
        self.maybe_enter_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Some(Permit::Normal),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max {
                    inner.probes_in_flight += 1;
                    Some(Permit::Probe)
                } else {
                    None
                }
            }
        }
    }

    fn maybe_enter_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.recovery_time {
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_in_flight = 0;
                    debug!(breaker = %self.name, "entering half-open");
                }
            }
        }
    }

    fn on_success(&self, permit: &Permit) {
        let mut inner = self.inner.lock();
        if let Permit::Probe = permit {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.probes_in_flight = 0;
                info!(breaker = %self.name, "circuit closed");
                drop(inner);
                self.emit(topics::CIRCUIT_BREAKER_CLOSED);
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, permit: &Permit) {
        let mut inner = self.inner.lock();
        if let Permit::Probe = permit {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probes_in_flight = 0;
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
                drop(inner);
                self.emit(topics::CIRCUIT_BREAKER_OPENED);
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "failure threshold reached, circuit opened"
                    );
                    drop(inner);
                    self.emit(topics::CIRCUIT_BREAKER_OPENED);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn emit(&self, topic: &str) {
        if let Some(bus) = &self.bus {
            bus.metrics().incr(&format!("circuit.{}.{}", self.name, topic));
            let _ = bus.publish_critical(
                topic,
                "circuit_breaker",
                serde_json::json!({ "breaker": self.name }),
            );
        }
    }
}
