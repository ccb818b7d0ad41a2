//! # Connection Pool
//!
//! Named HTTP pools with a fixed size plus optional overflow, a circuit
//! breaker wrapping every request, and a health-check URL polled on an
//! interval. Checkouts are matched on a unique token, so a worker can only
//! check in what it checked out.
//!
//! Failures are classified (`timeout | conn_refused | transport_closed |
//! 5xx | other`); only the first three classes are retried, with
//! exponential backoff.

use crate::circuit_breaker::{CallError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{FailureKind, ResilienceError, Result};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vsm_core::{topics, EventBus};

/// Default health-check polling interval
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Per-pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Base pool size (concurrent checkouts)
    pub size: usize,
    /// Extra checkouts allowed beyond the base size
    pub overflow: usize,
    /// Health endpoint polled every [`HEALTH_CHECK_INTERVAL`]
    pub health_check_url: Option<String>,
    /// Breaker wrapping each request
    pub breaker: CircuitBreakerConfig,
    /// Attempts for retryable failure classes
    pub retry_max: u32,
    /// Base backoff between attempts (doubled per attempt, with jitter)
    pub retry_base: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 8,
            overflow: 4,
            health_check_url: None,
            breaker: CircuitBreakerConfig::default(),
            retry_max: 3,
            retry_base: Duration::from_millis(50),
        }
    }
}

/// Snapshot of one pool's state
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Pool name
    pub name: String,
    /// Base size
    pub size: usize,
    /// Overflow allowance
    pub overflow: usize,
    /// Checkouts currently outstanding
    pub in_flight: usize,
    /// Whether the pool is draining
    pub draining: bool,
    /// Last health-check verdict (true until proven otherwise)
    pub healthy: bool,
    /// Breaker state
    pub breaker_state: CircuitState,
}

/// A checked-out slot; check it back in through the owning pool
pub struct Checkout {
    /// Unique token matched at check-in
    pub token: Uuid,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// One named HTTP connection pool
pub struct ConnectionPool {
    name: String,
    config: PoolConfig,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    checkouts: DashMap<Uuid, Instant>,
    breaker: CircuitBreaker,
    draining: AtomicBool,
    healthy: AtomicBool,
    bus: Option<Arc<EventBus>>,
}

impl ConnectionPool {
    /// Create a pool
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Result<Self> {
        if config.size == 0 {
            return Err(ResilienceError::InvalidConfig(
                "pool size must be positive".to_string(),
            ));
        }
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(config.breaker.timeout)
            .build()
            .map_err(|e| ResilienceError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            breaker: CircuitBreaker::new(format!("pool.{}", name), config.breaker.clone()),
            permits: Arc::new(Semaphore::new(config.size + config.overflow)),
            checkouts: DashMap::new(),
            client,
            draining: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            bus: None,
            name,
            config,
        })
    }

    /// Attach a bus for drain events and metrics
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.breaker = self.breaker.with_bus(Arc::clone(&bus));
        self.bus = Some(bus);
        self
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check out a slot
    ///
    /// Rejected while draining; waits for a permit otherwise.
    pub async fn checkout(&self) -> Result<Checkout> {
        if self.draining.load(Ordering::Acquire) {
            return Err(ResilienceError::PoolDraining {
                pool: self.name.clone(),
            });
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ResilienceError::PoolExhausted {
                pool: self.name.clone(),
            })?;

        let token = Uuid::new_v4();
        self.checkouts.insert(token, Instant::now());
        Ok(Checkout {
            token,
            _permit: permit,
        })
    }

    /// Check a slot back in; the token must match an outstanding checkout
    pub fn checkin(&self, checkout: Checkout) -> Result<()> {
        match self.checkouts.remove(&checkout.token) {
            Some(_) => Ok(()),
            None => Err(ResilienceError::InvalidConfig(format!(
                "checkout token {} unknown to pool {}",
                checkout.token, self.name
            ))),
        }
    }

    /// Execute a request through the pool
    ///
    /// Routes through the pool's circuit breaker; retryable failure
    /// classes are re-attempted up to `retry_max` times with exponential
    /// backoff and jitter.
    #[instrument(skip(self, req), fields(pool = %self.name))]
    pub async fn request(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let checkout = self.checkout().await?;
        let started = Instant::now();

        let mut attempt: u32 = 0;
        let result = loop {
            let Some(this_try) = req.try_clone() else {
                // Streaming bodies cannot be re-sent; single attempt
                break self.execute_once(req).await;
            };

            match self.execute_once(this_try).await {
                Ok(resp) => break Ok(resp),
                Err(e) => {
                    attempt += 1;
                    let retry = match &e {
                        ResilienceError::Transport { kind, .. } => kind.is_retryable(),
                        ResilienceError::Timeout(_) => true,
                        _ => false,
                    };
                    if !retry || attempt >= self.config.retry_max {
                        break Err(e);
                    }
                    let backoff = self.config.retry_base * 2u32.pow(attempt - 1);
                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2));
                    debug!(attempt, ?backoff, "retrying pooled request");
                    tokio::time::sleep(backoff + jitter).await;
                }
            }
        };

        if result.is_ok() {
            if let Some(bus) = &self.bus {
                bus.metrics().observe(
                    &format!("pool.{}.request_ms", self.name),
                    started.elapsed().as_secs_f64() * 1000.0,
                );
            }
        } else if let Some(bus) = &self.bus {
            bus.metrics().incr(&format!("pool.{}.failures", self.name));
        }

        self.checkin(checkout)?;
        result
    }

    async fn execute_once(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let outcome = self
            .breaker
            .call(|| async {
                let resp = req.send().await.map_err(classify_reqwest)?;
                if resp.status().is_server_error() {
                    return Err(ResilienceError::Transport {
                        kind: FailureKind::Http5xx,
                        message: format!("upstream returned {}", resp.status()),
                    });
                }
                Ok(resp)
            })
            .await;

        match outcome {
            Ok(resp) => Ok(resp),
            Err(CallError::CircuitOpen) => Err(ResilienceError::CircuitOpen {
                name: self.name.clone(),
            }),
            Err(CallError::Timeout(d)) => Err(ResilienceError::Timeout(d)),
            Err(CallError::Inner(e)) => Err(e),
        }
    }

    /// Start draining: reject new checkouts, let in-flight work finish
    /// within the grace window
    pub async fn drain(&self, grace: Duration) -> bool {
        self.draining.store(true, Ordering::Release);
        info!(pool = %self.name, "draining");
        if let Some(bus) = &self.bus {
            let _ = bus.publish_critical(
                topics::POOL_DRAINING,
                "connection_pool",
                serde_json::json!({ "pool": self.name }),
            );
        }

        let deadline = Instant::now() + grace;
        while !self.checkouts.is_empty() {
            if Instant::now() >= deadline {
                warn!(
                    pool = %self.name,
                    outstanding = self.checkouts.len(),
                    "drain grace expired with checkouts outstanding"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }

    /// Whether the last health check succeeded
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            size: self.config.size,
            overflow: self.config.overflow,
            in_flight: self.checkouts.len(),
            draining: self.draining.load(Ordering::Acquire),
            healthy: self.is_healthy(),
            breaker_state: self.breaker.state(),
        }
    }

    /// Spawn the 30 s health-check poller (no-op without a URL)
    pub fn spawn_health_checks(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let url = self.config.health_check_url.clone()?;
        let pool = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let ok = match pool.client.get(&url).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(_) => false,
                };
                let was = pool.healthy.swap(ok, Ordering::AcqRel);
                if let Some(bus) = &pool.bus {
                    bus.metrics()
                        .set_gauge(&format!("pool.{}.healthy", pool.name), ok as u8 as f64);
                }
                if was != ok {
                    if ok {
                        info!(pool = %pool.name, "health check recovered");
                    } else {
                        warn!(pool = %pool.name, url = %url, "health check failing");
                    }
                }
            }
        }))
    }
}

/// Registry of named pools
#[derive(Default)]
pub struct PoolManager {
    pools: DashMap<String, Arc<ConnectionPool>>,
}

impl PoolManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool under its name
    pub fn register(&self, pool: Arc<ConnectionPool>) {
        self.pools.insert(pool.name().to_string(), pool);
    }

    /// Look up a pool
    pub fn get(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(name).map(|p| Arc::clone(&p))
    }

    /// Stats for every registered pool
    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|p| p.stats()).collect()
    }

    /// Drain every pool with a shared grace window
    pub async fn drain_all(&self, grace: Duration) {
        for pool in self.pools.iter() {
            pool.drain(grace).await;
        }
    }
}

fn classify_reqwest(e: reqwest::Error) -> ResilienceError {
    let kind = if e.is_timeout() {
        FailureKind::Timeout
    } else if e.is_connect() {
        FailureKind::ConnRefused
    } else if e.is_request() || e.is_body() {
        FailureKind::TransportClosed
    } else {
        FailureKind::Other
    };
    ResilienceError::Transport {
        kind,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new("test", config).unwrap()
    }

    #[tokio::test]
    async fn test_checkout_tokens_are_matched() {
        let p = pool(PoolConfig::default());
        let a = p.checkout().await.unwrap();
        let b = p.checkout().await.unwrap();
        assert_ne!(a.token, b.token);

        p.checkin(a).unwrap();
        // Forged token (already checked in) is rejected
        let stale = Checkout {
            token: b.token,
            _permit: Arc::new(Semaphore::new(1))
                .try_acquire_owned()
                .unwrap(),
        };
        p.checkin(b).unwrap();
        assert!(p.checkin(stale).is_err());
    }

    #[tokio::test]
    async fn test_drain_rejects_new_checkouts() {
        let p = pool(PoolConfig::default());
        assert!(p.drain(Duration::from_millis(10)).await);
        assert!(matches!(
            p.checkout().await,
            Err(ResilienceError::PoolDraining { .. })
        ));
        assert!(p.stats().draining);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let p = Arc::new(pool(PoolConfig::default()));
        let held = p.checkout().await.unwrap();

        let drainer = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.drain(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        p.checkin(held).unwrap();

        assert!(drainer.await.unwrap());
    }

    #[tokio::test]
    async fn test_conn_refused_is_classified_and_retried() {
        let config = PoolConfig {
            retry_max: 2,
            retry_base: Duration::from_millis(5),
            breaker: CircuitBreakerConfig {
                failure_threshold: 100,
                timeout: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let p = pool(config);
        let client = reqwest::Client::new();

        // Nothing listens on port 1
        let result = p.request(client.get("http://127.0.0.1:1/")).await;
        match result {
            Err(ResilienceError::Transport { kind, .. }) => {
                assert_eq!(kind, FailureKind::ConnRefused);
            }
            other => panic!("expected transport error, got {:?}", other.map(|_| ())),
        }
        // Both attempts released their checkout
        assert_eq!(p.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_server_errors_are_not_retried() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let p = pool(PoolConfig {
            retry_max: 3,
            ..Default::default()
        });
        let client = reqwest::Client::new();
        let result = p.request(client.get(server.uri())).await;

        match result {
            Err(ResilienceError::Transport { kind, .. }) => {
                assert_eq!(kind, FailureKind::Http5xx);
            }
            other => panic!("expected 5xx classification, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_successful_request_round_trip() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let p = pool(PoolConfig::default());
        let client = reqwest::Client::new();
        let resp = p.request(client.get(server.uri())).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(p.stats().in_flight, 0);
    }
}
