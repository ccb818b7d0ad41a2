//! # VSM Resilience - Breakers, Limiters, Pools
//!
//! Stateless-interface infrastructure shared by every higher layer of the
//! runtime:
//!
//! - [`circuit_breaker`]: three-state breaker with bounded half-open
//!   probing; timeouts count as failures
//! - [`rate_limiter`]: continuous-refill token buckets scoped globally,
//!   per client, and per VSM level
//! - [`connection_pool`]: named HTTP pools with per-pool breakers,
//!   token-matched checkouts, retry classification, and drain support
//!
//! All three record into the shared metrics registry and announce state
//! changes on the bus when one is attached.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod rate_limiter;

pub use circuit_breaker::{CallError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use connection_pool::{ConnectionPool, PoolConfig, PoolManager, PoolStats};
pub use error::{FailureKind, ResilienceError, Result};
pub use rate_limiter::{BucketScope, RateLimiter, RateLimiterConfig};
