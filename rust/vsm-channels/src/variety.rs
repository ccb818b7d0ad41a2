//! # Variety Channels
//!
//! Typed, bounded, directed conduits between two named subsystems. Each
//! direction applies one variety transform: attenuation going up the
//! hierarchy (sampling, aggregation, distillation) and amplification
//! coming down (broadcast to units, constraint fan-out).
//!
//! A channel that stays full for longer than its overflow window
//! announces itself on the bus so the algedonic layer can convert the
//! condition into pain.

use crate::error::{ChannelError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use vsm_core::{topics, EventBus, HlcTimestamp, VsmLevel};

/// Default packet capacity per channel
pub const DEFAULT_CAPACITY: usize = 1000;

/// Continuous-full window before a channel announces overflow
pub const OVERFLOW_WINDOW: Duration = Duration::from_secs(1);

/// Variety classification carried by every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarietyType {
    /// Raw operational detail from S1 units
    Operational,
    /// Coordinated summaries produced by S2
    Coordinated,
    /// Decisions and outcomes for the audit trail
    Audit,
    /// Scenarios and anomalies for S5
    Intelligence,
    /// Constraints fanned out by S5
    Policy,
    /// Control commands from S3 down to S1
    Control,
}

/// One unit of variety in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarietyPacket {
    /// Variety classification
    pub packet_type: VarietyType,
    /// How many distinguishable states this packet represents
    pub volume: usize,
    /// Detected patterns riding along
    pub patterns: Vec<String>,
    /// Opaque payload owned by the producer
    pub payload: serde_json::Value,
    /// HLC stamp from the producing side
    pub timestamp: HlcTimestamp,
}

impl VarietyPacket {
    /// Build a packet
    pub fn new(
        packet_type: VarietyType,
        volume: usize,
        patterns: Vec<String>,
        payload: serde_json::Value,
        timestamp: HlcTimestamp,
    ) -> Self {
        Self {
            packet_type,
            volume,
            patterns,
            payload,
            timestamp,
        }
    }
}

/// The six directed channel positions of the viable system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Operational variety attenuated upward
    S1ToS2,
    /// Coordination summaries upward
    S2ToS3,
    /// Audit synthesis upward
    S3ToS4,
    /// Intelligence distillation upward
    S4ToS5,
    /// Control amplification downward
    S3ToS1,
    /// Constraint fan-out to every level
    S5ToAll,
}

impl ChannelKind {
    /// All six kinds, in supervisor wiring order
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::S1ToS2,
        ChannelKind::S2ToS3,
        ChannelKind::S3ToS4,
        ChannelKind::S4ToS5,
        ChannelKind::S3ToS1,
        ChannelKind::S5ToAll,
    ];

    /// Canonical name (`s1_to_s2` etc.)
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::S1ToS2 => "s1_to_s2",
            ChannelKind::S2ToS3 => "s2_to_s3",
            ChannelKind::S3ToS4 => "s3_to_s4",
            ChannelKind::S4ToS5 => "s4_to_s5",
            ChannelKind::S3ToS1 => "s3_to_s1",
            ChannelKind::S5ToAll => "s5_to_all",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running counters for one channel
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChannelStats {
    /// Packets accepted since creation
    pub messages_transmitted: u64,
    /// Packets currently queued
    pub current_flow: usize,
    /// Packets dropped to make room
    pub dropped: u64,
}

/// Directed, bounded variety conduit
pub struct VarietyChannel {
    kind: ChannelKind,
    capacity: usize,
    /// Fraction of patterns retained by upward attenuation
    attenuation_factor: f64,
    queue: Mutex<VecDeque<VarietyPacket>>,
    notify: Notify,
    transmitted: AtomicU64,
    dropped: AtomicU64,
    dropped_in_window: AtomicU64,
    full_since: Mutex<Option<Instant>>,
    bus: Arc<EventBus>,
}

impl VarietyChannel {
    /// Create a channel with the default capacity
    pub fn new(kind: ChannelKind, bus: Arc<EventBus>) -> Self {
        Self::with_capacity(kind, bus, DEFAULT_CAPACITY)
    }

    /// Create a channel with an explicit capacity
    pub fn with_capacity(kind: ChannelKind, bus: Arc<EventBus>, capacity: usize) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            attenuation_factor: 0.3,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            transmitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            dropped_in_window: AtomicU64::new(0),
            full_since: Mutex::new(None),
            bus,
        }
    }

    /// Set the fraction of patterns attenuation keeps
    pub fn with_attenuation_factor(mut self, factor: f64) -> Self {
        self.attenuation_factor = factor.clamp(0.01, 1.0);
        self
    }

    /// Which direction this channel serves
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Transmit a packet, applying this direction's variety transform
    ///
    /// Amplifying directions may enqueue several packets; the queue drops
    /// its oldest entry for each slot it is short.
    pub fn transmit(&self, packet: VarietyPacket) -> Result<()> {
        let outgoing = self.transform(packet);
        let mut queue = self.queue.lock();

        for packet in outgoing {
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.dropped_in_window.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(packet);
            self.transmitted.fetch_add(1, Ordering::Relaxed);
        }

        let at_capacity = queue.len() >= self.capacity;
        drop(queue);
        self.track_overflow(at_capacity);
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next packet, waiting until one arrives
    pub async fn receive(&self) -> VarietyPacket {
        loop {
            if let Some(packet) = self.try_receive() {
                return packet;
            }
            self.notify.notified().await;
        }
    }

    /// Dequeue without waiting
    pub fn try_receive(&self) -> Option<VarietyPacket> {
        let packet = self.queue.lock().pop_front();
        if packet.is_some() {
            trace!(channel = %self.kind, "packet received");
        }
        packet
    }

    /// Current counters
    pub fn get_channel_stats(&self) -> ChannelStats {
        ChannelStats {
            messages_transmitted: self.transmitted.load(Ordering::Relaxed),
            current_flow: self.queue.lock().len(),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Sustained-full detection; announces overflow pain once per window
    fn track_overflow(&self, at_capacity: bool) {
        let mut full_since = self.full_since.lock();
        if !at_capacity {
            *full_since = None;
            self.dropped_in_window.store(0, Ordering::Relaxed);
            return;
        }

        let now = Instant::now();
        match *full_since {
            None => *full_since = Some(now),
            Some(since) if now.duration_since(since) >= OVERFLOW_WINDOW => {
                let window_secs = now.duration_since(since).as_secs_f64();
                let drops = self.dropped_in_window.swap(0, Ordering::Relaxed);
                let rate = drops as f64 / window_secs.max(f64::EPSILON);
                let intensity = (rate / self.capacity as f64).clamp(0.1, 1.0);

                warn!(
                    channel = %self.kind,
                    drops,
                    intensity,
                    "channel full past overflow window"
                );
                let _ = self.bus.publish_critical(
                    topics::CHANNEL_OVERFLOW,
                    "variety_channel",
                    serde_json::json!({
                        "channel": self.kind.as_str(),
                        "dropped": drops,
                        "drop_rate": rate,
                        "intensity": intensity,
                    }),
                );
                // Re-arm so a persistently full channel keeps screaming
                *full_since = Some(now);
            }
            Some(_) => {}
        }
    }

    /// Apply the per-direction transform
    fn transform(&self, packet: VarietyPacket) -> Vec<VarietyPacket> {
        match self.kind {
            ChannelKind::S1ToS2 => vec![self.attenuate(packet)],
            ChannelKind::S2ToS3 => vec![aggregate(packet)],
            ChannelKind::S3ToS4 => vec![audit_synthesis(packet)],
            ChannelKind::S4ToS5 => vec![distill(packet)],
            ChannelKind::S3ToS1 => amplify(packet),
            ChannelKind::S5ToAll => constraint_fan_out(packet),
        }
    }

    /// Attenuation: keep the highest-entropy patterns, shed the rest
    fn attenuate(&self, mut packet: VarietyPacket) -> VarietyPacket {
        let keep = ((packet.patterns.len() as f64 * self.attenuation_factor).ceil() as usize)
            .clamp(1, packet.patterns.len().max(1));
        if packet.patterns.len() > keep {
            packet
                .patterns
                .sort_by(|a, b| shannon_entropy(b).total_cmp(&shannon_entropy(a)));
            packet.patterns.truncate(keep);
            packet.volume = (packet.volume as f64 * self.attenuation_factor).ceil() as usize;
        }
        packet
    }
}

/// Aggregation: summaries survive, raw operational detail does not
fn aggregate(packet: VarietyPacket) -> VarietyPacket {
    let mut patterns = packet.patterns;
    patterns.sort();
    patterns.dedup();

    VarietyPacket {
        packet_type: VarietyType::Coordinated,
        volume: packet.volume,
        payload: serde_json::json!({
            "summary": {
                "pattern_count": patterns.len(),
                "volume": packet.volume,
                "source": packet.payload.get("unit_id").cloned().unwrap_or_default(),
            }
        }),
        patterns,
        timestamp: packet.timestamp,
    }
}

/// Audit synthesis: decisions plus observed outcomes
fn audit_synthesis(packet: VarietyPacket) -> VarietyPacket {
    VarietyPacket {
        packet_type: VarietyType::Audit,
        payload: serde_json::json!({
            "decision": packet.payload.get("decision").cloned().unwrap_or(packet.payload.clone()),
            "outcome": packet.payload.get("outcome").cloned().unwrap_or_default(),
        }),
        ..packet
    }
}

/// Intelligence distillation: scenarios and anomalies, capped
fn distill(mut packet: VarietyPacket) -> VarietyPacket {
    packet.packet_type = VarietyType::Intelligence;
    packet.patterns.truncate(10);
    packet
}

/// Amplification: one control packet per addressed unit
fn amplify(packet: VarietyPacket) -> Vec<VarietyPacket> {
    let units: Vec<String> = packet
        .payload
        .get("units")
        .and_then(|u| u.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    if units.is_empty() {
        return vec![VarietyPacket {
            packet_type: VarietyType::Control,
            ..packet
        }];
    }

    units
        .into_iter()
        .map(|unit| {
            let mut payload = packet.payload.clone();
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("unit_id".to_string(), serde_json::json!(unit));
            }
            VarietyPacket {
                packet_type: VarietyType::Control,
                volume: packet.volume,
                patterns: packet.patterns.clone(),
                payload,
                timestamp: packet.timestamp.clone(),
            }
        })
        .collect()
}

/// Constraint fan-out: one policy packet per subordinate level
fn constraint_fan_out(packet: VarietyPacket) -> Vec<VarietyPacket> {
    [VsmLevel::S1, VsmLevel::S2, VsmLevel::S3, VsmLevel::S4]
        .iter()
        .map(|level| {
            let mut payload = packet.payload.clone();
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("target".to_string(), serde_json::json!(level.as_str()));
            }
            VarietyPacket {
                packet_type: VarietyType::Policy,
                volume: packet.volume,
                patterns: packet.patterns.clone(),
                payload,
                timestamp: packet.timestamp.clone(),
            }
        })
        .collect()
}

/// Shannon entropy over a string's character distribution
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    let len = s.chars().count() as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// The full set of six channels wired by the supervisor
pub struct ChannelSet {
    channels: HashMap<ChannelKind, Arc<VarietyChannel>>,
}

impl ChannelSet {
    /// Build all six channels against one bus
    pub fn new(bus: &Arc<EventBus>, capacity: usize) -> Self {
        let mut channels = HashMap::new();
        for kind in ChannelKind::ALL {
            channels.insert(
                kind,
                Arc::new(VarietyChannel::with_capacity(
                    kind,
                    Arc::clone(bus),
                    capacity,
                )),
            );
        }
        debug!(capacity, "variety channels wired");
        Self { channels }
    }

    /// Channel for one direction
    pub fn get(&self, kind: ChannelKind) -> Arc<VarietyChannel> {
        // ALL is exhaustive, so the entry always exists
        Arc::clone(&self.channels[&kind])
    }

    /// Stats for every channel
    pub fn stats(&self) -> HashMap<ChannelKind, ChannelStats> {
        self.channels
            .iter()
            .map(|(k, c)| (*k, c.get_channel_stats()))
            .collect()
    }

    /// Liveness check used by the supervisor's viability validation
    pub fn validate(&self) -> Result<()> {
        for kind in ChannelKind::ALL {
            if !self.channels.contains_key(&kind) {
                return Err(ChannelError::InvalidConfig(format!(
                    "channel {} missing",
                    kind
                )));
            }
        }
        Ok(())
    }
}
