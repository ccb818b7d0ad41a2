//! # Token-Bucket Rate Limiter
//!
//! Continuous-refill token buckets. Global, per-client, and per-subsystem
//! buckets coexist: a client bucket holds a tenth of the global capacity,
//! and subsystem buckets scale by level (S1 runs hot at 2x, S5 deliberates
//! at a quarter).
//!
//! `consume` refills from elapsed time, then either deducts and returns
//! the remaining balance or rejects without deduction.

use crate::error::{ResilienceError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use vsm_core::{topics, EventBus, VsmLevel};

/// Limiter tuning knobs
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Global bucket capacity (tokens)
    pub bucket_size: f64,
    /// Refill rate for the global bucket (tokens/sec)
    pub refill_rate: f64,
    /// Minimum spacing between emitted rate-limit events per bucket
    pub refill_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            bucket_size: 1000.0,
            refill_rate: 100.0,
            refill_interval: Duration::from_millis(100),
        }
    }
}

/// Which bucket a consumption is charged against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketScope {
    /// The single process-wide bucket
    Global,
    /// One bucket per client id, capacity = global / 10
    Client(String),
    /// One bucket per VSM level, capacity scaled by level
    Subsystem(VsmLevel),
}

impl BucketScope {
    fn key(&self) -> String {
        match self {
            BucketScope::Global => "global".to_string(),
            BucketScope::Client(id) => format!("client/{}", id),
            BucketScope::Subsystem(level) => format!("subsystem/{}", level),
        }
    }

    /// Capacity multiplier relative to the global bucket
    fn scale(&self) -> f64 {
        match self {
            BucketScope::Global => 1.0,
            BucketScope::Client(_) => 0.1,
            BucketScope::Subsystem(VsmLevel::S1) => 2.0,
            BucketScope::Subsystem(VsmLevel::S2)
            | BucketScope::Subsystem(VsmLevel::S3)
            | BucketScope::Subsystem(VsmLevel::S4) => 1.0,
            BucketScope::Subsystem(VsmLevel::S5) => 0.25,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    last_reject_event: Option<Instant>,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
            last_reject_event: None,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Deduct `n` tokens, returning the remaining balance, or `None`
    /// without deduction when the balance is short
    fn try_consume(&mut self, n: f64) -> Option<f64> {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            Some(self.tokens)
        } else {
            None
        }
    }
}

/// Registry of coexisting token buckets
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: DashMap<String, Mutex<TokenBucket>>,
    bus: Option<Arc<EventBus>>,
}

impl RateLimiter {
    /// Create a limiter
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            bus: None,
        }
    }

    /// Attach a bus for `rate_limit_allowed` / `rate_limited` events
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Consume `n` tokens from the scoped bucket
    ///
    /// Returns the remaining balance on success; `RateLimited` without
    /// deduction otherwise.
    pub fn consume(&self, scope: &BucketScope, n: f64) -> Result<f64> {
        let key = scope.key();
        let scale = scope.scale();
        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            Mutex::new(TokenBucket::new(
                self.config.bucket_size * scale,
                self.config.refill_rate * scale,
            ))
        });

        let mut bucket = bucket.lock();
        match bucket.try_consume(n) {
            Some(remaining) => {
                trace!(bucket = %key, remaining, "rate limit allowed");
                if let Some(bus) = &self.bus {
                    bus.metrics().incr("ratelimit.allowed");
                    let _ = bus.publish_critical(
                        topics::RATE_LIMIT_ALLOWED,
                        "rate_limiter",
                        serde_json::json!({ "bucket": key, "remaining": remaining }),
                    );
                }
                Ok(remaining)
            }
            None => {
                let emit = match bucket.last_reject_event {
                    Some(at) => at.elapsed() >= self.config.refill_interval,
                    None => true,
                };
                if emit {
                    bucket.last_reject_event = Some(Instant::now());
                    if let Some(bus) = &self.bus {
                        bus.metrics().incr("ratelimit.rejected");
                        let _ = bus.publish_critical(
                            topics::RATE_LIMITED,
                            "rate_limiter",
                            serde_json::json!({ "bucket": key, "requested": n }),
                        );
                    }
                }
                Err(ResilienceError::RateLimited { bucket: key })
            }
        }
    }

    /// Remaining tokens in a bucket without consuming
    pub fn balance(&self, scope: &BucketScope) -> Option<f64> {
        self.buckets.get(&scope.key()).map(|b| {
            let mut bucket = b.lock();
            bucket.refill();
            bucket.tokens
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(size: f64, rate: f64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            bucket_size: size,
            refill_rate: rate,
            refill_interval: Duration::from_millis(100),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_exhaustion() {
        let l = limiter(10.0, 5.0);

        for expected_remaining in (0..10).rev() {
            let remaining = l.consume(&BucketScope::Global, 1.0).unwrap();
            assert!((remaining - expected_remaining as f64).abs() < 1e-9);
        }
        for _ in 0..5 {
            assert!(matches!(
                l.consume(&BucketScope::Global, 1.0),
                Err(ResilienceError::RateLimited { .. })
            ));
        }

        // One second refills 5 tokens exactly
        tokio::time::advance(Duration::from_secs(1)).await;
        let remaining = l.consume(&BucketScope::Global, 5.0).unwrap();
        assert!(remaining.abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_does_not_deduct() {
        let l = limiter(10.0, 0.0);
        l.consume(&BucketScope::Global, 8.0).unwrap();
        assert!(l.consume(&BucketScope::Global, 5.0).is_err());
        // The failed consume left the balance untouched
        let remaining = l.consume(&BucketScope::Global, 2.0).unwrap();
        assert!((remaining - 0.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let l = limiter(10.0, 100.0);
        l.consume(&BucketScope::Global, 10.0).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((l.balance(&BucketScope::Global).unwrap() - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scoped_capacities() {
        let l = limiter(100.0, 10.0);
        // Touch each bucket so balances exist
        l.consume(&BucketScope::Global, 0.0).unwrap();
        l.consume(&BucketScope::Client("c1".into()), 0.0).unwrap();
        l.consume(&BucketScope::Subsystem(VsmLevel::S1), 0.0).unwrap();
        l.consume(&BucketScope::Subsystem(VsmLevel::S3), 0.0).unwrap();
        l.consume(&BucketScope::Subsystem(VsmLevel::S5), 0.0).unwrap();

        assert_eq!(l.balance(&BucketScope::Global), Some(100.0));
        assert_eq!(l.balance(&BucketScope::Client("c1".into())), Some(10.0));
        assert_eq!(l.balance(&BucketScope::Subsystem(VsmLevel::S1)), Some(200.0));
        assert_eq!(l.balance(&BucketScope::Subsystem(VsmLevel::S3)), Some(100.0));
        assert_eq!(l.balance(&BucketScope::Subsystem(VsmLevel::S5)), Some(25.0));
    }
}
