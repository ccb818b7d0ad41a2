//! # Belief Stores and the Consensus Service
//!
//! One store per VSM level, each owned by the consensus actor: at most
//! 100 live beliefs, TTL expiry, eviction by lowest weighted score.
//! Voting is reputation-weighted; quarantined nodes' votes are discarded
//! without failing the caller. Proposals above the urgency bypass go
//! straight to the algedonic emergency channel.

use crate::belief::{Belief, BeliefMeta, URGENCY_BYPASS};
use crate::delta::{BeliefDelta, DeltaBatch, DeltaLog, DeltaOp, PeerSyncState, PeerTransport};
use crate::error::{ConsensusError, Result};
use crate::reputation::{ReputationConfig, ReputationTracker};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vsm_channels::{Severity, Signal};
use vsm_core::{hlc, topics, EventBus, HybridLogicalClock, VsmLevel};

/// Consensus tuning knobs
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Live belief cap per level
    pub max_per_level: usize,
    /// Default TTL applied when a proposal leaves it unset
    pub default_ttl_ms: u64,
    /// Fraction of reputation-weighted support required for acceptance
    pub consensus_threshold: f64,
    /// Reputation tuning
    pub reputation: ReputationConfig,
    /// Delta sync period
    pub sync_interval: Duration,
    /// Base retry backoff for unreachable peers
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_max: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            max_per_level: 100,
            default_ttl_ms: crate::belief::DEFAULT_TTL_MS,
            consensus_threshold: 2.0 / 3.0,
            reputation: ReputationConfig::default(),
            sync_interval: Duration::from_secs(5),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// One belief with its current support, as returned by `get_consensus`
#[derive(Debug, Clone, Serialize)]
pub struct BeliefSupport {
    /// The belief
    pub belief: Belief,
    /// Reputation-weighted support in `[0, 1]` (proposal weight until voted on)
    pub support: f64,
    /// Whether support meets the consensus threshold
    pub accepted: bool,
}

struct LevelStore {
    level: VsmLevel,
    beliefs: HashMap<Uuid, Belief>,
    votes: HashMap<Uuid, HashMap<String, f64>>,
    log: DeltaLog,
}

impl LevelStore {
    fn find_by_content(&self, content: &str) -> Option<Uuid> {
        self.beliefs
            .values()
            .find(|b| b.content == content)
            .map(|b| b.id)
    }

    fn evict_to_cap(&mut self, cap: usize, clock: &HybridLogicalClock) -> Result<()> {
        while self.beliefs.len() >= cap {
            let Some(victim) = self
                .beliefs
                .values()
                .min_by(|a, b| a.weighted_score().total_cmp(&b.weighted_score()))
                .map(|b| b.id)
            else {
                break;
            };
            self.beliefs.remove(&victim);
            self.votes.remove(&victim);
            self.log
                .append(DeltaOp::Remove, victim, clock.tick_or_fallback(), None)?;
            debug!(level = %self.level, belief = %victim, "belief evicted at cap");
        }
        Ok(())
    }

    fn gc_expired(&mut self, clock: &HybridLogicalClock) -> Result<usize> {
        let now_ms = hlc::wall_ms();
        let expired: Vec<Uuid> = self
            .beliefs
            .values()
            .filter(|b| b.is_expired(now_ms))
            .map(|b| b.id)
            .collect();
        for id in &expired {
            self.beliefs.remove(id);
            self.votes.remove(id);
            self.log
                .append(DeltaOp::Remove, *id, clock.tick_or_fallback(), None)?;
        }
        Ok(expired.len())
    }

    /// CRDT merge of one remote delta; returns whether state changed
    fn merge_delta(&mut self, delta: &BeliefDelta, cap: usize) -> bool {
        match (&delta.op, &delta.payload) {
            (DeltaOp::Remove, _) => match self.beliefs.get(&delta.belief_id) {
                Some(existing) if delta.timestamp > existing.timestamp => {
                    self.beliefs.remove(&delta.belief_id);
                    self.votes.remove(&delta.belief_id);
                    true
                }
                _ => false,
            },
            (_, Some(incoming)) => match self.beliefs.get_mut(&delta.belief_id) {
                Some(existing) => {
                    let mut changed = false;
                    // Last-writer-wins on content, max on weight
                    if incoming.timestamp > existing.timestamp {
                        let kept_weight = existing.weight.max(incoming.weight);
                        *existing = incoming.clone();
                        existing.weight = kept_weight;
                        changed = true;
                    } else if incoming.weight > existing.weight {
                        existing.weight = incoming.weight;
                        changed = true;
                    }
                    changed
                }
                None => {
                    if self.beliefs.len() >= cap {
                        return false;
                    }
                    self.beliefs.insert(delta.belief_id, incoming.clone());
                    true
                }
            },
            (_, None) => false,
        }
    }
}

/// Reputation-weighted belief consensus across the five levels
pub struct ConsensusService {
    config: ConsensusConfig,
    bus: Arc<EventBus>,
    clock: Arc<HybridLogicalClock>,
    reputation: Arc<ReputationTracker>,
    levels: HashMap<VsmLevel, Mutex<LevelStore>>,
    peers: Mutex<HashMap<String, PeerSyncState>>,
    transport: Option<Arc<dyn PeerTransport>>,
}

impl ConsensusService {
    /// Create the service; pass a sled db to persist delta logs
    pub fn new(
        bus: Arc<EventBus>,
        clock: Arc<HybridLogicalClock>,
        config: ConsensusConfig,
        db: Option<&sled::Db>,
    ) -> Result<Self> {
        let reputation = Arc::new(
            ReputationTracker::new(config.reputation.clone()).with_bus(Arc::clone(&bus)),
        );

        let mut levels = HashMap::new();
        for level in VsmLevel::ALL {
            levels.insert(
                level,
                Mutex::new(LevelStore {
                    level,
                    beliefs: HashMap::new(),
                    votes: HashMap::new(),
                    log: DeltaLog::open(level, db)?,
                }),
            );
        }

        Ok(Self {
            config,
            bus,
            clock,
            reputation,
            levels,
            peers: Mutex::new(HashMap::new()),
            transport: None,
        })
    }

    /// Attach a peer transport and the peer set to sync with
    pub fn with_transport(mut self, transport: Arc<dyn PeerTransport>, peers: Vec<String>) -> Self {
        self.transport = Some(transport);
        let mut map = self.peers.lock();
        for peer in peers {
            map.entry(peer).or_default();
        }
        drop(map);
        self
    }

    /// Shared reputation tracker (S2 feeds oscillation membership here)
    pub fn reputation(&self) -> Arc<ReputationTracker> {
        Arc::clone(&self.reputation)
    }

    /// Propose a belief at a level
    ///
    /// Re-proposing identical content coalesces onto the existing id.
    /// Urgency above 0.95 additionally rides the algedonic bypass with
    /// intensity equal to the urgency.
    #[instrument(skip(self, content, meta), fields(level = %level))]
    pub fn propose_belief(
        &self,
        level: VsmLevel,
        proposer: &str,
        content: impl Into<String>,
        meta: BeliefMeta,
    ) -> Result<Uuid> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ConsensusError::InvalidInput("empty belief content".into()));
        }
        meta.validate().map_err(ConsensusError::InvalidInput)?;

        self.reputation.record_message(proposer);
        if self.reputation.is_quarantined(proposer) {
            self.bus.metrics().incr("consensus.proposals_dropped");
            return Err(ConsensusError::ByzantineQuarantined {
                node: proposer.to_string(),
            });
        }

        let store = self.level(level);
        let mut store = store.lock();

        if let Some(existing) = store.find_by_content(&content) {
            debug!(level = %level, belief = %existing, "proposal coalesced");
            return Ok(existing);
        }

        store.evict_to_cap(self.config.max_per_level, &self.clock)?;

        let belief = Belief::new(content, level, &meta, self.clock.tick()?);
        let id = belief.id;
        store.log.append(
            DeltaOp::Add,
            id,
            belief.timestamp.clone(),
            Some(belief.clone()),
        )?;
        store.beliefs.insert(id, belief.clone());
        drop(store);

        self.bus.metrics().incr("consensus.proposals");
        if meta.urgency > URGENCY_BYPASS {
            let signal = Signal::new(
                proposer,
                format!("urgent_belief:{}", level),
                meta.urgency,
                Severity::Critical,
                self.clock.tick_or_fallback(),
            );
            warn!(level = %level, urgency = meta.urgency, "belief riding algedonic bypass");
            let _ = self.bus.publish_critical(
                topics::EMERGENCY_ALGEDONIC,
                "belief_consensus",
                serde_json::to_value(&signal).unwrap_or_default(),
            );
        }

        Ok(id)
    }

    /// Cast a reputation-weighted vote
    ///
    /// Votes from quarantined nodes are dropped internally: reputation
    /// bookkeeping still runs, an event is emitted, and the caller sees
    /// success.
    pub fn vote_on_belief(
        &self,
        level: VsmLevel,
        belief_id: Uuid,
        node_id: &str,
        weight: f64,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(ConsensusError::InvalidInput(format!(
                "vote weight {} outside [0, 1]",
                weight
            )));
        }

        self.reputation.record_message(node_id);
        self.reputation
            .record_vote(node_id, belief_id, weight >= 0.5);

        let store = self.level(level);
        let mut store = store.lock();
        if !store.beliefs.contains_key(&belief_id) {
            return Err(ConsensusError::NotFound(belief_id));
        }

        if self.reputation.is_quarantined(node_id) {
            drop(store);
            warn!(node = node_id, belief = %belief_id, "vote dropped, node quarantined");
            self.bus.metrics().incr("consensus.votes_dropped");
            return Ok(());
        }

        store
            .votes
            .entry(belief_id)
            .or_default()
            .insert(node_id.to_string(), weight);

        // Fold accumulated support back into the belief weight
        let support = self.support_of(&store, belief_id);
        let ts = self.clock.tick()?;
        let store = &mut *store;
        if let Some(belief) = store.beliefs.get_mut(&belief_id) {
            belief.weight = support;
            belief.timestamp = ts.clone();
            let updated = belief.clone();
            store
                .log
                .append(DeltaOp::Update, belief_id, ts, Some(updated))?;
        }

        self.bus.metrics().incr("consensus.votes");
        Ok(())
    }

    /// Current consensus view of a level
    ///
    /// Expired beliefs are collected first; quarantined nodes' votes are
    /// excluded from every support figure.
    pub fn get_consensus(&self, level: VsmLevel) -> Result<Vec<BeliefSupport>> {
        let store = self.level(level);
        let mut store = store.lock();
        store.gc_expired(&self.clock)?;

        let mut view: Vec<BeliefSupport> = store
            .beliefs
            .values()
            .map(|belief| {
                let support = self.support_of(&store, belief.id);
                BeliefSupport {
                    support,
                    accepted: support >= self.config.consensus_threshold,
                    belief: belief.clone(),
                }
            })
            .collect();
        view.sort_by(|a, b| b.support.total_cmp(&a.support));
        Ok(view)
    }

    /// Authoritatively replace a level's beliefs
    ///
    /// Prior delta history is retained but marked superseded; the forced
    /// set is written as fresh adds and wins downstream merges by HLC.
    #[instrument(skip(self, beliefs), fields(level = %level))]
    pub fn force_consensus(
        &self,
        level: VsmLevel,
        beliefs: Vec<(String, BeliefMeta)>,
    ) -> Result<Vec<Uuid>> {
        let store = self.level(level);
        let mut store = store.lock();

        let head = store.log.head();
        store.log.mark_superseded_before(head)?;
        store.beliefs.clear();
        store.votes.clear();

        let mut ids = Vec::with_capacity(beliefs.len());
        for (content, meta) in beliefs {
            meta.validate().map_err(ConsensusError::InvalidInput)?;
            let belief = Belief::new(content, level, &meta, self.clock.tick()?);
            store.log.append(
                DeltaOp::Add,
                belief.id,
                belief.timestamp.clone(),
                Some(belief.clone()),
            )?;
            ids.push(belief.id);
            store.beliefs.insert(belief.id, belief);
        }

        info!(level = %level, count = ids.len(), "consensus forced");
        self.bus.metrics().incr("consensus.forced");
        Ok(ids)
    }

    /// Live belief count per level (invariant: never above the cap)
    pub fn belief_counts(&self) -> HashMap<VsmLevel, usize> {
        VsmLevel::ALL
            .iter()
            .map(|level| (*level, self.level(*level).lock().beliefs.len()))
            .collect()
    }

    /// Apply a batch received from a peer; returns how many deltas
    /// changed state (idempotent for re-deliveries)
    pub fn apply_batch(&self, batch: &DeltaBatch) -> Result<usize> {
        let store = self.level(batch.level);
        let mut store = store.lock();

        let mut ordered: Vec<&BeliefDelta> = batch.entries.iter().collect();
        ordered.sort_by(|a, b| {
            (a.belief_id, &a.timestamp).cmp(&(b.belief_id, &b.timestamp))
        });

        let mut changed = 0;
        for delta in ordered {
            // Remote stamps advance the local clock past everything seen
            let _ = self.clock.observe(&delta.timestamp);
            if store.merge_delta(delta, self.config.max_per_level) {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(level = %batch.level, changed, "remote deltas merged");
        }
        Ok(changed)
    }

    /// One sync pass: ship pending deltas to every due peer
    pub async fn sync_tick(&self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };

        let due: Vec<String> = {
            let peers = self.peers.lock();
            peers
                .iter()
                .filter(|(_, s)| s.due())
                .map(|(p, _)| p.clone())
                .collect()
        };

        for peer in due {
            for level in VsmLevel::ALL {
                let (batch, head) = {
                    let acked = {
                        let peers = self.peers.lock();
                        peers
                            .get(&peer)
                            .and_then(|s| s.acked.get(&level).copied())
                            .unwrap_or(0)
                    };
                    let store = self.level(level);
                    let store = store.lock();
                    let entries = store.log.entries_since(acked);
                    (
                        DeltaBatch { level, entries },
                        store.log.head(),
                    )
                };

                if batch.entries.is_empty() {
                    continue;
                }

                match transport.send(&peer, &batch).await {
                    Ok(()) => {
                        let mut peers = self.peers.lock();
                        if let Some(state) = peers.get_mut(&peer) {
                            state.record_success(level, head);
                        }
                        self.bus.metrics().add("consensus.deltas_shipped", batch.entries.len() as u64);
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "delta sync failed, backing off");
                        let mut peers = self.peers.lock();
                        if let Some(state) = peers.get_mut(&peer) {
                            state.record_failure(self.config.backoff_base, self.config.backoff_max);
                        }
                        self.bus.metrics().incr("consensus.sync_failures");
                        break;
                    }
                }
            }
        }
    }

    /// Run periodic sync and TTL collection until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("belief consensus running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for level in VsmLevel::ALL {
                        let store = self.level(level);
                        let mut store = store.lock();
                        if let Err(e) = store.gc_expired(&self.clock) {
                            warn!(level = %level, error = %e, "belief GC failed");
                        }
                    }
                    self.sync_tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("belief consensus stopped");
    }

    fn level(&self, level: VsmLevel) -> &Mutex<LevelStore> {
        // Every level is populated in new()
        &self.levels[&level]
    }

    /// Reputation-weighted support, quarantined voters excluded
    fn support_of(&self, store: &LevelStore, belief_id: Uuid) -> f64 {
        let Some(votes) = store.votes.get(&belief_id) else {
            return store
                .beliefs
                .get(&belief_id)
                .map(|b| b.weight)
                .unwrap_or(0.0);
        };

        let mut weighted = 0.0;
        let mut total = 0.0;
        for (node, vote) in votes {
            if self.reputation.is_quarantined(node) {
                continue;
            }
            let rep = self.reputation.score(node);
            weighted += rep * vote;
            total += rep;
        }

        if total == 0.0 {
            store
                .beliefs
                .get(&belief_id)
                .map(|b| b.weight)
                .unwrap_or(0.0)
        } else {
            weighted / total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsm_core::MetricsRegistry;

    fn service() -> ConsensusService {
        let clock = Arc::new(HybridLogicalClock::new("consensus-test"));
        let bus = Arc::new(EventBus::new(clock.clone(), Arc::new(MetricsRegistry::new())));
        ConsensusService::new(bus, clock, ConsensusConfig::default(), None).unwrap()
    }

    #[tokio::test]
    async fn test_propose_then_get_consensus_round_trip() {
        let s = service();
        let id = s
            .propose_belief(VsmLevel::S3, "node-a", "io saturation ahead", BeliefMeta::default())
            .unwrap();

        let view = s.get_consensus(VsmLevel::S3).unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].belief.id, id);
        assert_eq!(view[0].belief.content, "io saturation ahead");
    }

    #[tokio::test]
    async fn test_identical_proposals_coalesce() {
        let s = service();
        let meta = BeliefMeta::default();
        let a = s
            .propose_belief(VsmLevel::S4, "node-a", "cpu trend rising", meta.clone())
            .unwrap();
        let b = s
            .propose_belief(VsmLevel::S4, "node-b", "cpu trend rising", meta)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(s.belief_counts()[&VsmLevel::S4], 1);
    }

    #[tokio::test]
    async fn test_level_cap_evicts_lowest_score() {
        let clock = Arc::new(HybridLogicalClock::new("cap-test"));
        let bus = Arc::new(EventBus::new(clock.clone(), Arc::new(MetricsRegistry::new())));
        let s = ConsensusService::new(
            bus,
            clock,
            ConsensusConfig {
                max_per_level: 3,
                ..Default::default()
            },
            None,
        )
        .unwrap();

        let weak = s
            .propose_belief(
                VsmLevel::S1,
                "node-a",
                "weak belief",
                BeliefMeta {
                    weight: 0.1,
                    confidence: 0.1,
                    ..Default::default()
                },
            )
            .unwrap();
        for i in 0..3 {
            s.propose_belief(
                VsmLevel::S1,
                "node-a",
                format!("strong belief {}", i),
                BeliefMeta {
                    weight: 0.9,
                    confidence: 0.9,
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let counts = s.belief_counts();
        assert_eq!(counts[&VsmLevel::S1], 3);
        let view = s.get_consensus(VsmLevel::S1).unwrap();
        assert!(view.iter().all(|b| b.belief.id != weak));
    }

    #[tokio::test]
    async fn test_quarantined_votes_are_excluded() {
        let s = service();
        let id = s
            .propose_belief(VsmLevel::S2, "node-a", "shared resource contended", BeliefMeta::default())
            .unwrap();

        s.vote_on_belief(VsmLevel::S2, id, "honest-1", 0.9).unwrap();
        s.vote_on_belief(VsmLevel::S2, id, "honest-2", 0.8).unwrap();

        // N1 flips approve/reject/approve and lands in quarantine
        s.vote_on_belief(VsmLevel::S2, id, "n1", 0.9).unwrap();
        s.vote_on_belief(VsmLevel::S2, id, "n1", 0.1).unwrap();
        s.vote_on_belief(VsmLevel::S2, id, "n1", 0.9).unwrap();
        assert!(s.reputation().is_quarantined("n1"));

        let view = s.get_consensus(VsmLevel::S2).unwrap();
        let entry = view.iter().find(|b| b.belief.id == id).unwrap();
        // Support is the mean of the two honest votes only
        assert!((entry.support - 0.85).abs() < 1e-9);
        assert!(entry.accepted);
    }

    #[tokio::test]
    async fn test_force_consensus_supersedes_history() {
        let s = service();
        s.propose_belief(VsmLevel::S5, "node-a", "old doctrine", BeliefMeta::default())
            .unwrap();

        let ids = s
            .force_consensus(
                VsmLevel::S5,
                vec![("new doctrine".to_string(), BeliefMeta {
                    weight: 1.0,
                    confidence: 1.0,
                    ..Default::default()
                })],
            )
            .unwrap();
        assert_eq!(ids.len(), 1);

        let view = s.get_consensus(VsmLevel::S5).unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].belief.content, "new doctrine");
    }

    #[tokio::test]
    async fn test_urgent_proposal_rides_bypass() {
        let s = service();
        let mut emergency = s.bus.subscribe(topics::EMERGENCY_ALGEDONIC).unwrap();

        s.propose_belief(
            VsmLevel::S1,
            "node-a",
            "cascading failure imminent",
            BeliefMeta {
                urgency: 0.99,
                ..Default::default()
            },
        )
        .unwrap();

        let event = emergency.recv().await.unwrap();
        assert_eq!(event.data["intensity"].as_f64().unwrap(), 0.99);
    }

    #[tokio::test]
    async fn test_apply_batch_is_idempotent() {
        let a = service();
        let b = service();

        let id = a
            .propose_belief(VsmLevel::S3, "node-a", "replicated belief", BeliefMeta::default())
            .unwrap();
        let batch = {
            let store = a.level(VsmLevel::S3).lock();
            DeltaBatch {
                level: VsmLevel::S3,
                entries: store.log.entries_since(0),
            }
        };

        let first = b.apply_batch(&batch).unwrap();
        assert!(first > 0);
        let second = b.apply_batch(&batch).unwrap();
        assert_eq!(second, 0, "identical state sync is a no-op");

        let view = b.get_consensus(VsmLevel::S3).unwrap();
        assert_eq!(view[0].belief.id, id);
    }
}
