//! Intervention audit trail

use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;
use vsm_core::hlc;

/// Bounded audit capacity
pub const AUDIT_RING: usize = 1000;

/// One recorded intervention
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Entry id
    pub id: Uuid,
    /// What was acted on
    pub target: String,
    /// Action taken
    pub action: String,
    /// Inputs the decision was based on
    pub inputs: serde_json::Value,
    /// Human-readable decision
    pub decision: String,
    /// Wall-clock milliseconds of the decision
    pub timestamp_ms: u64,
    /// Observed outcome, filled in after the fact
    pub outcome: Option<String>,
}

impl AuditEntry {
    /// Record a decision now
    pub fn new(
        target: impl Into<String>,
        action: impl Into<String>,
        inputs: serde_json::Value,
        decision: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            action: action.into(),
            inputs,
            decision: decision.into(),
            timestamp_ms: hlc::wall_ms(),
            outcome: None,
        }
    }
}

/// Bounded audit log
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: VecDeque<AuditEntry>,
}

impl AuditLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, evicting the oldest past capacity
    pub fn record(&mut self, entry: AuditEntry) -> Uuid {
        let id = entry.id;
        if self.entries.len() >= AUDIT_RING {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        id
    }

    /// Attach an observed outcome to an entry
    pub fn set_outcome(&mut self, id: Uuid, outcome: impl Into<String>) -> bool {
        for entry in self.entries.iter_mut().rev() {
            if entry.id == id {
                entry.outcome = Some(outcome.into());
                return true;
            }
        }
        false
    }

    /// Entries within the trailing window
    pub fn window(&self, window_ms: u64) -> Vec<AuditEntry> {
        let cutoff = hlc::wall_ms().saturating_sub(window_ms);
        self.entries
            .iter()
            .filter(|e| e.timestamp_ms >= cutoff)
            .cloned()
            .collect()
    }

    /// Total entries retained
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
