//! # VSM Consensus - Reputation-Weighted Beliefs
//!
//! Per-level weighted-vote belief stores with Byzantine detection and
//! CRDT-style delta sync across peers:
//!
//! - [`belief`]: the weighted, time-bounded assertion type
//! - [`reputation`]: node scoring, decay rules, and quarantine
//! - [`store`]: the per-level stores, voting, and force-consensus
//! - [`delta`]: the append-only delta log and compressed sync batches
//!
//! Each level's store is owned by the consensus actor; subsystems reach
//! it only through the service API and the bus.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod belief;
pub mod delta;
pub mod error;
pub mod reputation;
pub mod store;

pub use belief::{Belief, BeliefMeta};
pub use delta::{BeliefDelta, DeltaBatch, DeltaLog, DeltaOp, PeerTransport};
pub use error::{ConsensusError, Result};
pub use reputation::{NodeStanding, ReputationConfig, ReputationTracker};
pub use store::{BeliefSupport, ConsensusConfig, ConsensusService};
