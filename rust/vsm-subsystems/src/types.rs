//! Shared types and the subsystem trait

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use vsm_core::VsmLevel;

/// Health tick period shared by every subsystem
pub const HEALTH_INTERVAL_MS: u64 = 1000;

/// Control mode of an S1 unit (or of S1 as a whole)
///
/// Only `s3_control` messages and emergency algedonic broadcasts may
/// change it; at most one mode is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Accepting work normally
    Normal,
    /// Accepting work at reduced rate
    Throttled,
    /// Refusing all work
    EmergencyStop,
}

impl Default for ControlMode {
    fn default() -> Self {
        ControlMode::Normal
    }
}

/// A long-running supervised subsystem actor
///
/// Each implementation owns its mutable state exclusively and talks to
/// the rest of the system only through the bus and its variety channels.
#[async_trait]
pub trait Subsystem: Send + Sync {
    /// Which VSM level this subsystem implements
    fn level(&self) -> VsmLevel;

    /// Current health score in `[0, 1]`
    async fn health(&self) -> f64;

    /// Run until the shutdown signal flips
    async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()>;
}

/// Payload of the per-level health events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Health score in `[0, 1]`
    pub health: f64,
    /// Fraction of failed requests over the recent window
    pub error_rate: f64,
    /// Mean recent latency in milliseconds
    pub response_time_ms: f64,
    /// Items waiting in the subsystem's queues
    pub queue_depth: f64,
    /// Requests handled per second
    pub throughput: f64,
}
