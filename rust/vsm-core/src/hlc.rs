//! # Hybrid Logical Clock
//!
//! Single process-wide clock producing totally ordered timestamps
//! `(physical_ms, logical, node_id)`. Physical time comes from the wall
//! clock; the logical counter disambiguates ticks within the same
//! millisecond and absorbs remote clocks that run ahead of ours.
//!
//! The clock is the one deliberate contention point in the runtime.
//! Callers that cannot acquire it within a bounded retry budget fall back
//! to a wall-clock timestamp tagged with the `emergency_fallback` node id,
//! so critical paths (algedonic screams) can always stamp their signals.
//!
//! ## Example
//!
//! ```rust
//! use vsm_core::hlc::HybridLogicalClock;
//!
//! let clock = HybridLogicalClock::new("node-a");
//! let a = clock.tick().unwrap();
//! let b = clock.tick().unwrap();
//! assert!(a < b);
//! ```

use crate::error::{CoreError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Node id used on the emergency fallback path
pub const FALLBACK_NODE_ID: &str = "emergency_fallback";

/// Maximum lock-acquisition attempts before falling back
const MAX_TICK_ATTEMPTS: u32 = 3;

/// Initial backoff between acquisition attempts
const TICK_BACKOFF: Duration = Duration::from_micros(50);

/// Totally ordered hybrid timestamp
///
/// Ordering is lexicographic on `(physical_ms, logical, node_id)`, which
/// the derived `Ord` provides through field order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    /// Wall-clock milliseconds since the Unix epoch
    pub physical_ms: u64,
    /// Logical counter within the same physical millisecond
    pub logical: u32,
    /// Identifier of the node that produced the timestamp
    pub node_id: String,
}

impl HlcTimestamp {
    /// Timestamp produced on the emergency fallback path, outside the clock lock
    pub fn emergency_fallback() -> Self {
        Self {
            physical_ms: wall_ms(),
            logical: 0,
            node_id: FALLBACK_NODE_ID.to_string(),
        }
    }

    /// Whether this timestamp was produced by the fallback path
    pub fn is_fallback(&self) -> bool {
        self.node_id == FALLBACK_NODE_ID
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.physical_ms, self.logical, self.node_id)
    }
}

#[derive(Debug)]
struct ClockState {
    physical_ms: u64,
    logical: u32,
}

/// Process-wide hybrid logical clock
///
/// All events published on the bus are stamped by one shared instance, so
/// timestamps from a single node are strictly monotonic.
#[derive(Debug)]
pub struct HybridLogicalClock {
    node_id: String,
    state: Mutex<ClockState>,
}

impl HybridLogicalClock {
    /// Create a clock with an explicit node id
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: Mutex::new(ClockState {
                physical_ms: 0,
                logical: 0,
            }),
        }
    }

    /// Create a clock whose node id is derived from the hostname plus a
    /// short random suffix, so two processes on one host stay distinct
    pub fn with_hostname() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        Self::new(format!("{}-{}", host, suffix))
    }

    /// The node id stamped on every timestamp this clock produces
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Produce the next local timestamp
    ///
    /// Retries lock acquisition up to three times with exponential backoff
    /// and returns `CoreError::HlcUnavailable` when the budget is spent.
    pub fn tick(&self) -> Result<HlcTimestamp> {
        let mut state = self.acquire()?;
        let w = wall_ms();

        if w > state.physical_ms {
            state.physical_ms = w;
            state.logical = 0;
        } else {
            state.logical += 1;
        }

        Ok(HlcTimestamp {
            physical_ms: state.physical_ms,
            logical: state.logical,
            node_id: self.node_id.clone(),
        })
    }

    /// Produce the next timestamp, never failing
    ///
    /// Critical paths (emergency screams) must be able to stamp a signal
    /// even when the clock lock is contended; they receive a wall-clock
    /// timestamp tagged `emergency_fallback` instead of an error.
    pub fn tick_or_fallback(&self) -> HlcTimestamp {
        match self.tick() {
            Ok(ts) => ts,
            Err(e) => {
                warn!(error = %e, "HLC unavailable, using fallback timestamp");
                HlcTimestamp::emergency_fallback()
            }
        }
    }

    /// Merge a remote timestamp and produce the next local one
    ///
    /// Keeps the local clock ahead of every timestamp it has observed:
    /// `p ← max(p, rp, w)` and the logical counter advances past whichever
    /// of the local and remote counters is still live at `p`.
    pub fn observe(&self, remote: &HlcTimestamp) -> Result<HlcTimestamp> {
        let mut state = self.acquire()?;
        let w = wall_ms();
        let (p, l) = (state.physical_ms, state.logical);
        let (rp, rl) = (remote.physical_ms, remote.logical);

        let new_p = p.max(rp).max(w);
        let new_l = if new_p == p && new_p == rp {
            l.max(rl) + 1
        } else if new_p == p {
            l + 1
        } else if new_p == rp {
            rl + 1
        } else {
            // Fresh wall-clock millisecond dominates both counters
            0
        };

        state.physical_ms = new_p;
        state.logical = new_l;

        Ok(HlcTimestamp {
            physical_ms: new_p,
            logical: new_l,
            node_id: self.node_id.clone(),
        })
    }

    fn acquire(&self) -> Result<parking_lot::MutexGuard<'_, ClockState>> {
        let mut backoff = TICK_BACKOFF;
        for attempt in 1..=MAX_TICK_ATTEMPTS {
            if let Some(guard) = self.state.try_lock() {
                return Ok(guard);
            }
            if attempt < MAX_TICK_ATTEMPTS {
                std::thread::sleep(backoff);
                backoff *= 4;
            }
        }
        Err(CoreError::HlcUnavailable {
            attempts: MAX_TICK_ATTEMPTS,
        })
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_strictly_increase() {
        let clock = HybridLogicalClock::new("test");
        let mut prev = clock.tick().unwrap();
        for _ in 0..1000 {
            let next = clock.tick().unwrap();
            assert!(next > prev, "{} should exceed {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn test_observe_advances_past_remote() {
        let clock = HybridLogicalClock::new("local");
        let remote = HlcTimestamp {
            physical_ms: wall_ms() + 10_000,
            logical: 7,
            node_id: "remote".to_string(),
        };

        let merged = clock.observe(&remote).unwrap();
        assert!(merged.physical_ms >= remote.physical_ms);
        assert!(merged > remote || merged.node_id < remote.node_id);

        // Next local tick must still move forward
        let next = clock.tick().unwrap();
        assert!(next > merged);
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = HlcTimestamp {
            physical_ms: 1,
            logical: 9,
            node_id: "z".to_string(),
        };
        let b = HlcTimestamp {
            physical_ms: 2,
            logical: 0,
            node_id: "a".to_string(),
        };
        assert!(a < b);

        let c = HlcTimestamp {
            physical_ms: 2,
            logical: 0,
            node_id: "b".to_string(),
        };
        assert!(b < c);
    }

    #[test]
    fn test_fallback_timestamp_is_tagged() {
        let ts = HlcTimestamp::emergency_fallback();
        assert!(ts.is_fallback());
        assert_eq!(ts.node_id, FALLBACK_NODE_ID);
        assert!(ts.physical_ms > 0);
    }
}
