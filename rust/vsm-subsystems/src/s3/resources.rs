//! Resource pools owned by S3
//!
//! All reservations flow through the control subsystem; nothing else
//! writes these pools. Invariant: the sum of reservations equals the
//! allocated figure and never exceeds the total.

use crate::error::{Result, SubsystemError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// The four pooled resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Processor share
    Cpu,
    /// Memory share
    Memory,
    /// IO bandwidth share
    Io,
    /// Network bandwidth share
    Network,
}

impl ResourceKind {
    /// All pooled kinds
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Io,
        ResourceKind::Network,
    ];

    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Io => "io",
            ResourceKind::Network => "network",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = SubsystemError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(ResourceKind::Cpu),
            "memory" => Ok(ResourceKind::Memory),
            "io" => Ok(ResourceKind::Io),
            "network" => Ok(ResourceKind::Network),
            other => Err(SubsystemError::NotFound(format!("resource {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    amount: f64,
    deadline: Option<Instant>,
}

/// One bounded resource pool
#[derive(Debug)]
pub struct ResourcePool {
    total: f64,
    reservations: HashMap<String, Reservation>,
}

/// Serializable pool view
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// Pool capacity
    pub total: f64,
    /// Sum of reservations
    pub allocated: f64,
    /// Reservation per unit
    pub reservations: HashMap<String, f64>,
}

impl ResourcePool {
    /// Create a pool with the given capacity
    pub fn new(total: f64) -> Self {
        Self {
            total,
            reservations: HashMap::new(),
        }
    }

    /// Sum of live reservations
    pub fn allocated(&self) -> f64 {
        self.reservations.values().map(|r| r.amount).sum()
    }

    /// Remaining capacity
    pub fn available(&self) -> f64 {
        (self.total - self.allocated()).max(0.0)
    }

    /// Reserve `amount` for `unit`, stacking onto any existing hold
    ///
    /// A `ttl` bounds the reservation; the grace tick reclaims it once
    /// the deadline passes (covers cancelled and timed-out callers).
    pub fn reserve(&mut self, unit: &str, amount: f64, ttl: Option<Duration>) -> Result<()> {
        if amount <= 0.0 {
            return Err(SubsystemError::InvalidInput(format!(
                "reservation amount {} must be positive",
                amount
            )));
        }
        let available = self.available();
        if amount > available {
            return Err(SubsystemError::ResourceExhausted {
                resource: "pool".to_string(),
                requested: amount,
                available,
            });
        }

        let deadline = ttl.map(|t| Instant::now() + t);
        let entry = self
            .reservations
            .entry(unit.to_string())
            .or_insert(Reservation {
                amount: 0.0,
                deadline,
            });
        entry.amount += amount;
        entry.deadline = deadline;
        Ok(())
    }

    /// Release a unit's whole reservation; returns the freed amount
    pub fn release(&mut self, unit: &str) -> f64 {
        self.reservations
            .remove(unit)
            .map(|r| r.amount)
            .unwrap_or(0.0)
    }

    /// Reclaim reservations whose deadline has passed
    pub fn release_expired(&mut self) -> Vec<(String, f64)> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .reservations
            .iter()
            .filter(|(_, r)| r.deadline.map(|d| now >= d).unwrap_or(false))
            .map(|(unit, _)| unit.clone())
            .collect();

        expired
            .into_iter()
            .map(|unit| {
                let amount = self.release(&unit);
                (unit, amount)
            })
            .collect()
    }

    /// Serializable view
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            total: self.total,
            allocated: self.allocated(),
            reservations: self
                .reservations
                .iter()
                .map(|(unit, r)| (unit.clone(), r.amount))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reservations_sum_to_allocated_and_respect_total() {
        let mut pool = ResourcePool::new(1.0);
        pool.reserve("s1_1", 0.4, None).unwrap();
        pool.reserve("s1_2", 0.5, None).unwrap();

        let snap = pool.snapshot();
        let sum: f64 = snap.reservations.values().sum();
        assert!((snap.allocated - sum).abs() < 1e-9);
        assert!(snap.allocated <= snap.total);

        // Over-reserving is refused without mutating state
        let err = pool.reserve("s1_3", 0.2, None);
        assert!(matches!(err, Err(SubsystemError::ResourceExhausted { .. })));
        assert!((pool.allocated() - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_release_returns_amount() {
        let mut pool = ResourcePool::new(1.0);
        pool.reserve("s1_1", 0.4, None).unwrap();
        assert!((pool.release("s1_1") - 0.4).abs() < 1e-9);
        assert_eq!(pool.release("s1_1"), 0.0);
        assert!((pool.available() - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_reservations_are_reclaimed() {
        let mut pool = ResourcePool::new(1.0);
        pool.reserve("s1_1", 0.4, Some(Duration::from_millis(500)))
            .unwrap();
        pool.reserve("s1_2", 0.3, None).unwrap();

        assert!(pool.release_expired().is_empty());
        tokio::time::advance(Duration::from_millis(500)).await;

        let reclaimed = pool.release_expired();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].0, "s1_1");
        assert!((pool.allocated() - 0.3).abs() < 1e-9);
    }
}
