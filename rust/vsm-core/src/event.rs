//! Event type and the well-known topic names

use crate::hlc::HlcTimestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known bus topics
///
/// Producers and consumers address each other only through these names,
/// so they live in one place instead of being retyped at every call site.
pub mod topics {
    /// Wildcard topic delivered every published event
    pub const ALL: &str = ":all";
    /// S1 operational health, consumed by the algedonic channel
    pub const S1_HEALTH: &str = "s1_health";
    /// S2 coordination health
    pub const S2_HEALTH: &str = "s2_health";
    /// S3 control health
    pub const S3_HEALTH: &str = "s3_health";
    /// S4 intelligence health
    pub const S4_HEALTH: &str = "s4_health";
    /// S5 policy health
    pub const S5_HEALTH: &str = "s5_health";
    /// Raw operational variety emitted by S1 units
    pub const S1_OPERATIONS: &str = "s1_operations";
    /// Coordinated variety arriving at S2
    pub const S2_COORDINATION: &str = "s2_coordination";
    /// Control commands from S3 down to S1
    pub const S3_CONTROL: &str = "s3_control";
    /// Pain signals requiring an S3 intervention
    pub const S3_INTERVENTION_REQUIRED: &str = "s3_intervention_required";
    /// Intelligence reports from S4 up to S5
    pub const S4_INTELLIGENCE: &str = "s4_intelligence";
    /// Policy constraints fanned out by S5
    pub const S5_POLICY: &str = "s5_policy";
    /// Pain signals below the critical threshold
    pub const ALGEDONIC_PAIN: &str = "algedonic_pain";
    /// Pleasure signals
    pub const ALGEDONIC_PLEASURE: &str = "algedonic_pleasure";
    /// Critical signals bypassing the hierarchy
    pub const EMERGENCY_ALGEDONIC: &str = "emergency_algedonic";
    /// Direct override line into S5
    pub const S5_EMERGENCY_OVERRIDE: &str = "s5_emergency_override";
    /// Broadcast channel reaching every subsystem
    pub const ALL_SUBSYSTEMS: &str = "all_subsystems";
    /// Supervisor reports a viable system after boot
    pub const VSM_VIABLE: &str = "vsm_viable";
    /// Supervisor announces shutdown
    pub const VSM_SHUTDOWN: &str = "vsm_shutdown";
    /// Supervisor lost viability (restart budget exhausted)
    pub const VSM_FAILURE: &str = "vsm_failure";
    /// Whole-system shutdown requested by the algedonic channel
    pub const SYSTEM_SHUTDOWN: &str = "system_shutdown";
    /// A subscriber queue overflowed and dropped events
    pub const BUS_OVERFLOW: &str = "bus_overflow";
    /// Oscillation patterns forwarded from S2 for S4 learning
    pub const S2_PATTERN_DETECTED: &str = "s2_pattern_detected";
    /// A variety channel stayed full past its overflow window
    pub const CHANNEL_OVERFLOW: &str = "channel_overflow";
    /// Circuit breaker opened
    pub const CIRCUIT_BREAKER_OPENED: &str = "circuit_breaker_opened";
    /// Circuit breaker closed again
    pub const CIRCUIT_BREAKER_CLOSED: &str = "circuit_breaker_closed";
    /// Token bucket allowed a request
    pub const RATE_LIMIT_ALLOWED: &str = "rate_limit_allowed";
    /// Token bucket rejected a request
    pub const RATE_LIMITED: &str = "rate_limited";
    /// Connection pool started draining
    pub const POOL_DRAINING: &str = "pool_draining";

    /// Control topic addressed to one S1 unit
    pub fn unit_control(unit_id: &str) -> String {
        format!("s1_control_{}", unit_id)
    }
}

/// Immutable event carried by the bus
///
/// `event_type` mirrors the topic the event was published on; `data` is an
/// opaque JSON map owned by the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique id (per node)
    pub id: Uuid,
    /// Topic tag
    pub event_type: String,
    /// Originating subsystem
    pub subsystem: String,
    /// Opaque payload
    pub data: serde_json::Value,
    /// Totally ordered timestamp
    pub timestamp: HlcTimestamp,
    /// ISO-8601 mirror of the physical component, for humans and logs
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Build an event stamped with the given timestamp
    pub fn new(
        topic: impl Into<String>,
        subsystem: impl Into<String>,
        data: serde_json::Value,
        timestamp: HlcTimestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: topic.into(),
            subsystem: subsystem.into(),
            data,
            timestamp,
            created_at: Utc::now(),
        }
    }
}
