//! # Node Reputation and Byzantine Detection
//!
//! Every voting node starts at a reputation of 1.0. The score decays on
//! contradictory votes over the same belief, on sustained message
//! flooding, and on membership in an S2-flagged oscillation. A node whose
//! score falls below the quarantine threshold has its votes discarded
//! until an operator intervenes.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;
use vsm_core::EventBus;

/// Reputation tuning knobs
#[derive(Debug, Clone)]
pub struct ReputationConfig {
    /// Score below which a node is quarantined
    pub byzantine_threshold: f64,
    /// Decay for a contradictory vote
    pub contradiction_penalty: f64,
    /// Decay applied once per flood window while flooding
    pub flood_penalty: f64,
    /// Decay for membership in a flagged oscillation
    pub oscillation_penalty: f64,
    /// Messages per second considered flooding
    pub flood_rate: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            byzantine_threshold: 0.3,
            contradiction_penalty: 0.4,
            flood_penalty: 0.15,
            oscillation_penalty: 0.25,
            flood_rate: 100,
        }
    }
}

/// Snapshot of one node's standing
#[derive(Debug, Clone, Serialize)]
pub struct NodeStanding {
    /// Node id
    pub node_id: String,
    /// Current score in `[0, 1]`
    pub score: f64,
    /// Whether votes from this node are discarded
    pub quarantined: bool,
}

#[derive(Debug)]
struct NodeState {
    score: f64,
    quarantined: bool,
    /// Last vote direction per belief (true = approval)
    votes: HashMap<Uuid, bool>,
    message_times: VecDeque<Instant>,
    last_flood_penalty: Option<Instant>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            score: 1.0,
            quarantined: false,
            votes: HashMap::new(),
            message_times: VecDeque::new(),
            last_flood_penalty: None,
        }
    }
}

/// Shared reputation tracker, one per process
pub struct ReputationTracker {
    config: ReputationConfig,
    nodes: DashMap<String, Mutex<NodeState>>,
    bus: Option<Arc<EventBus>>,
}

impl ReputationTracker {
    /// Create a tracker
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            nodes: DashMap::new(),
            bus: None,
        }
    }

    /// Attach a bus for quarantine announcements
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Current score (1.0 for unknown nodes)
    pub fn score(&self, node_id: &str) -> f64 {
        self.nodes
            .get(node_id)
            .map(|n| n.lock().score)
            .unwrap_or(1.0)
    }

    /// Whether this node's votes are discarded
    pub fn is_quarantined(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .map(|n| n.lock().quarantined)
            .unwrap_or(false)
    }

    /// Standing of every known node
    pub fn standings(&self) -> Vec<NodeStanding> {
        self.nodes
            .iter()
            .map(|entry| {
                let state = entry.value().lock();
                NodeStanding {
                    node_id: entry.key().clone(),
                    score: state.score,
                    quarantined: state.quarantined,
                }
            })
            .collect()
    }

    /// Record a vote direction; a flip over the same belief is
    /// contradictory and decays the score
    pub fn record_vote(&self, node_id: &str, belief_id: Uuid, approval: bool) {
        let contradiction = {
            let entry = self.node(node_id);
            let mut state = entry.lock();
            matches!(state.votes.insert(belief_id, approval), Some(prev) if prev != approval)
        };

        if contradiction {
            self.decay(
                node_id,
                self.config.contradiction_penalty,
                "contradictory vote",
            );
        }
    }

    /// Record a message arrival for flood accounting
    ///
    /// Sustained rates above `flood_rate`/s decay the score once per
    /// one-second window.
    pub fn record_message(&self, node_id: &str) {
        let flood = {
            let entry = self.node(node_id);
            let mut state = entry.lock();
            let now = Instant::now();
            state.message_times.push_back(now);
            while let Some(front) = state.message_times.front() {
                if now.duration_since(*front) > Duration::from_secs(1) {
                    state.message_times.pop_front();
                } else {
                    break;
                }
            }

            let flooding = state.message_times.len() > self.config.flood_rate;
            let penalize = flooding
                && state
                    .last_flood_penalty
                    .map(|at| now.duration_since(at) >= Duration::from_secs(1))
                    .unwrap_or(true);
            if penalize {
                state.last_flood_penalty = Some(now);
            }
            penalize
        };

        if flood {
            self.decay(node_id, self.config.flood_penalty, "message flooding");
        }
    }

    /// Decay for association with an S2-flagged oscillation
    pub fn record_oscillation_member(&self, node_id: &str) {
        self.decay(
            node_id,
            self.config.oscillation_penalty,
            "oscillation association",
        );
    }

    fn node(&self, node_id: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<NodeState>> {
        self.nodes
            .entry(node_id.to_string())
            .or_default()
            .downgrade()
    }

    fn decay(&self, node_id: &str, amount: f64, reason: &str) {
        let entry = self.node(node_id);
        let mut state = entry.lock();
        state.score = (state.score - amount).max(0.0);
        debug!(node = node_id, score = state.score, reason, "reputation decayed");

        if !state.quarantined && state.score < self.config.byzantine_threshold {
            state.quarantined = true;
            let score = state.score;
            drop(state);
            drop(entry);
            warn!(node = node_id, score, reason, "node quarantined");
            if let Some(bus) = &self.bus {
                bus.metrics().incr("consensus.quarantined");
                let _ = bus.publish_critical(
                    "byzantine_quarantined",
                    "belief_consensus",
                    serde_json::json!({ "node": node_id, "score": score, "reason": reason }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_nodes_start_trusted() {
        let t = ReputationTracker::new(ReputationConfig::default());
        assert_eq!(t.score("n1"), 1.0);
        assert!(!t.is_quarantined("n1"));
    }

    #[tokio::test]
    async fn test_contradictions_lead_to_quarantine() {
        let t = ReputationTracker::new(ReputationConfig::default());
        let belief = Uuid::new_v4();

        // approve -> reject -> approve: two flips take the score to 0.2
        t.record_vote("n1", belief, true);
        t.record_vote("n1", belief, false);
        t.record_vote("n1", belief, true);
        assert!((t.score("n1") - 0.2).abs() < 1e-9);
        assert!(t.is_quarantined("n1"));
    }

    #[tokio::test]
    async fn test_consistent_votes_keep_reputation() {
        let t = ReputationTracker::new(ReputationConfig::default());
        let belief = Uuid::new_v4();
        for _ in 0..10 {
            t.record_vote("n1", belief, true);
        }
        assert_eq!(t.score("n1"), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flooding_decays_once_per_window() {
        let t = ReputationTracker::new(ReputationConfig::default());
        for _ in 0..150 {
            t.record_message("n1");
        }
        // One penalty despite 50 over-limit messages in the same window
        assert!((t.score("n1") - 0.85).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..150 {
            t.record_message("n1");
        }
        assert!((t.score("n1") - 0.70).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_oscillation_membership_decays() {
        let t = ReputationTracker::new(ReputationConfig::default());
        t.record_oscillation_member("s1_1");
        assert!((t.score("s1_1") - 0.75).abs() < 1e-9);
    }
}
