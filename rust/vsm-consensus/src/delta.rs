//! # Belief Delta Log and Sync Wire Format
//!
//! Each level records per-operation deltas (add/remove/update) in an
//! append-only log, optionally persisted to sled. Batches ship to peers
//! periodically, compressed with lz4 once they pass 5 KB. Merging is
//! CRDT-style eventually consistent: operations commute by
//! `(belief_id, HLC timestamp)` with last-writer-wins on content and max
//! on weight.

use crate::belief::Belief;
use crate::error::{ConsensusError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;
use vsm_core::{HlcTimestamp, VsmLevel};

/// Batches larger than this are lz4-compressed on the wire
pub const COMPRESS_THRESHOLD: usize = 5 * 1024;

/// Delta operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Belief inserted
    Add,
    /// Belief fields rewritten
    Update,
    /// Belief evicted or expired
    Remove,
}

/// One append-only log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefDelta {
    /// Position in this level's log
    pub seq: u64,
    /// Operation
    pub op: DeltaOp,
    /// Subject belief
    pub belief_id: Uuid,
    /// HLC stamp deciding merge order
    pub timestamp: HlcTimestamp,
    /// SHA-256 of the payload (hex), empty for removals
    pub payload_hash: String,
    /// Belief state carried by add/update
    pub payload: Option<Belief>,
    /// Set when a later force_consensus made this entry historical
    pub superseded: bool,
}

impl BeliefDelta {
    fn hash_payload(payload: &Option<Belief>) -> Result<String> {
        let Some(belief) = payload else {
            return Ok(String::new());
        };
        let bytes = bincode::serialize(belief)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Append-only per-level delta log
pub struct DeltaLog {
    level: VsmLevel,
    entries: Vec<BeliefDelta>,
    next_seq: u64,
    tree: Option<sled::Tree>,
}

impl DeltaLog {
    /// Open a log, persisting to a sled tree when a db is given
    pub fn open(level: VsmLevel, db: Option<&sled::Db>) -> Result<Self> {
        let tree = match db {
            Some(db) => Some(db.open_tree(format!("belief_deltas_{}", level))?),
            None => None,
        };

        let mut entries = Vec::new();
        let mut next_seq = 0;
        if let Some(tree) = &tree {
            for row in tree.iter() {
                let (_, value) = row?;
                let delta: BeliefDelta = bincode::deserialize(&value)?;
                next_seq = next_seq.max(delta.seq + 1);
                entries.push(delta);
            }
            entries.sort_by_key(|d| d.seq);
        }

        Ok(Self {
            level,
            entries,
            next_seq,
            tree,
        })
    }

    /// Level this log belongs to
    pub fn level(&self) -> VsmLevel {
        self.level
    }

    /// Append one operation
    pub fn append(
        &mut self,
        op: DeltaOp,
        belief_id: Uuid,
        timestamp: HlcTimestamp,
        payload: Option<Belief>,
    ) -> Result<u64> {
        let delta = BeliefDelta {
            seq: self.next_seq,
            op,
            belief_id,
            payload_hash: BeliefDelta::hash_payload(&payload)?,
            timestamp,
            payload,
            superseded: false,
        };

        if let Some(tree) = &self.tree {
            tree.insert(delta.seq.to_be_bytes(), bincode::serialize(&delta)?)?;
        }
        self.next_seq += 1;
        self.entries.push(delta);
        Ok(self.next_seq - 1)
    }

    /// Entries at or after `seq`, excluding superseded history
    pub fn entries_since(&self, seq: u64) -> Vec<BeliefDelta> {
        self.entries
            .iter()
            .filter(|d| d.seq >= seq && !d.superseded)
            .cloned()
            .collect()
    }

    /// Highest appended sequence plus one
    pub fn head(&self) -> u64 {
        self.next_seq
    }

    /// Mark every entry before `seq` as superseded history
    ///
    /// Used by force_consensus: history is retained, not rewritten, but no
    /// longer ships to peers.
    pub fn mark_superseded_before(&mut self, seq: u64) -> Result<()> {
        for delta in self.entries.iter_mut().filter(|d| d.seq < seq) {
            if !delta.superseded {
                delta.superseded = true;
                if let Some(tree) = &self.tree {
                    tree.insert(delta.seq.to_be_bytes(), bincode::serialize(&*delta)?)?;
                }
            }
        }
        Ok(())
    }

    /// Total entries, superseded included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Batch of deltas shipped to one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch {
    /// Level the entries belong to
    pub level: VsmLevel,
    /// Entries in sequence order
    pub entries: Vec<BeliefDelta>,
}

impl DeltaBatch {
    /// Encode for the wire; payloads past 5 KB are lz4-compressed
    ///
    /// The first byte marks the framing (0 raw, 1 compressed), so
    /// identical batches encode byte-equal.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let raw = bincode::serialize(self)?;
        if raw.len() > COMPRESS_THRESHOLD {
            let compressed = lz4::block::compress(&raw, None, true)
                .map_err(|e| ConsensusError::Encoding(e.to_string()))?;
            let mut framed = Vec::with_capacity(compressed.len() + 1);
            framed.push(1u8);
            framed.extend_from_slice(&compressed);
            Ok(framed)
        } else {
            let mut framed = Vec::with_capacity(raw.len() + 1);
            framed.push(0u8);
            framed.extend_from_slice(&raw);
            Ok(framed)
        }
    }

    /// Decode a wire frame
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (marker, body) = bytes
            .split_first()
            .ok_or_else(|| ConsensusError::Encoding("empty frame".to_string()))?;
        let raw = match marker {
            0 => body.to_vec(),
            1 => lz4::block::decompress(body, None)
                .map_err(|e| ConsensusError::Encoding(e.to_string()))?,
            other => {
                return Err(ConsensusError::Encoding(format!(
                    "unknown frame marker {}",
                    other
                )))
            }
        };
        Ok(bincode::deserialize(&raw)?)
    }
}

/// Transport used to ship batches to peers
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver one encoded batch to a peer
    async fn send(&self, peer: &str, batch: &DeltaBatch) -> Result<()>;
}

/// Per-peer sync bookkeeping with exponential backoff
#[derive(Debug)]
pub struct PeerSyncState {
    /// Acknowledged log head per level
    pub acked: std::collections::HashMap<VsmLevel, u64>,
    /// Consecutive failures
    pub failures: u32,
    /// Earliest next attempt
    pub next_attempt: Instant,
}

impl PeerSyncState {
    /// Fresh peer state
    pub fn new() -> Self {
        Self {
            acked: std::collections::HashMap::new(),
            failures: 0,
            next_attempt: Instant::now(),
        }
    }

    /// Whether this peer is due for a sync attempt
    pub fn due(&self) -> bool {
        Instant::now() >= self.next_attempt
    }

    /// Record a successful ship of `head` for `level`
    pub fn record_success(&mut self, level: VsmLevel, head: u64) {
        self.acked.insert(level, head);
        self.failures = 0;
        self.next_attempt = Instant::now();
    }

    /// Record a failure and push the next attempt out exponentially
    pub fn record_failure(&mut self, base: Duration, max: Duration) {
        self.failures = self.failures.saturating_add(1);
        let exp = base.saturating_mul(2u32.saturating_pow(self.failures.min(16) - 1));
        self.next_attempt = Instant::now() + exp.min(max);
    }
}

impl Default for PeerSyncState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::belief::BeliefMeta;
    use vsm_core::HybridLogicalClock;

    fn belief(clock: &HybridLogicalClock, content: &str) -> Belief {
        Belief::new(
            content,
            VsmLevel::S3,
            &BeliefMeta::default(),
            clock.tick().unwrap(),
        )
    }

    #[test]
    fn test_append_and_replay() {
        let clock = HybridLogicalClock::new("delta-test");
        let mut log = DeltaLog::open(VsmLevel::S3, None).unwrap();

        let b = belief(&clock, "queue depth rising");
        log.append(DeltaOp::Add, b.id, b.timestamp.clone(), Some(b.clone()))
            .unwrap();
        log.append(DeltaOp::Remove, b.id, clock.tick().unwrap(), None)
            .unwrap();

        assert_eq!(log.head(), 2);
        let pending = log.entries_since(0);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].op, DeltaOp::Add);
        assert!(!pending[0].payload_hash.is_empty());
        assert!(pending[1].payload_hash.is_empty());
    }

    #[test]
    fn test_persisted_log_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("deltas")).unwrap();
        let clock = HybridLogicalClock::new("delta-test");

        {
            let mut log = DeltaLog::open(VsmLevel::S2, Some(&db)).unwrap();
            let b = belief(&clock, "persisted");
            log.append(DeltaOp::Add, b.id, b.timestamp.clone(), Some(b))
                .unwrap();
        }

        let log = DeltaLog::open(VsmLevel::S2, Some(&db)).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.head(), 1);
    }

    #[test]
    fn test_superseded_entries_stop_shipping() {
        let clock = HybridLogicalClock::new("delta-test");
        let mut log = DeltaLog::open(VsmLevel::S5, None).unwrap();
        for i in 0..3 {
            let b = belief(&clock, &format!("belief {}", i));
            log.append(DeltaOp::Add, b.id, b.timestamp.clone(), Some(b))
                .unwrap();
        }

        log.mark_superseded_before(2).unwrap();
        let pending = log.entries_since(0);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, 2);
        // History is retained even though it no longer ships
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_encode_is_deterministic_and_round_trips() {
        let clock = HybridLogicalClock::new("delta-test");
        let b = belief(&clock, "wire");
        let batch = DeltaBatch {
            level: VsmLevel::S1,
            entries: vec![BeliefDelta {
                seq: 0,
                op: DeltaOp::Add,
                belief_id: b.id,
                timestamp: b.timestamp.clone(),
                payload_hash: String::new(),
                payload: Some(b),
                superseded: false,
            }],
        };

        let one = batch.encode().unwrap();
        let two = batch.encode().unwrap();
        assert_eq!(one, two);
        assert_eq!(DeltaBatch::decode(&one).unwrap(), batch);
    }

    #[test]
    fn test_large_batches_compress() {
        let clock = HybridLogicalClock::new("delta-test");
        let entries: Vec<BeliefDelta> = (0..200)
            .map(|i| {
                let b = belief(&clock, &format!("repetitive content {}", i % 3));
                BeliefDelta {
                    seq: i,
                    op: DeltaOp::Add,
                    belief_id: b.id,
                    timestamp: b.timestamp.clone(),
                    payload_hash: String::new(),
                    payload: Some(b),
                    superseded: false,
                }
            })
            .collect();
        let batch = DeltaBatch {
            level: VsmLevel::S4,
            entries,
        };

        let encoded = batch.encode().unwrap();
        assert_eq!(encoded[0], 1, "batch past 5 KB should be compressed");
        assert_eq!(DeltaBatch::decode(&encoded).unwrap(), batch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_resets() {
        let mut peer = PeerSyncState::new();
        assert!(peer.due());

        peer.record_failure(Duration::from_millis(500), Duration::from_secs(60));
        assert!(!peer.due());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(peer.due());

        peer.record_failure(Duration::from_millis(500), Duration::from_secs(60));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!peer.due());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(peer.due());

        peer.record_success(VsmLevel::S1, 5);
        assert!(peer.due());
        assert_eq!(peer.acked.get(&VsmLevel::S1), Some(&5));
    }
}
