//! # VSM Subsystems - S1 through S5
//!
//! The five control subsystems of the viable system, each a supervised
//! long-running actor with exclusive ownership of its mutable state:
//!
//! - [`s1`] Operations: executes units of work, reports load and health
//! - [`s2`] Coordination: resolves resource contention, dampens
//!   oscillation between S1 units
//! - [`s3`] Control: owns the resource pools, closes the loop back to S1,
//!   keeps the audit trail
//! - [`s4`] Intelligence: models the environment, learns from audits,
//!   projects scenarios
//! - [`s5`] Policy: holds the identity and evaluates decisions against
//!   ethics and constraints
//!
//! Subsystems talk only over the bus and their variety channels; the
//! S1↔S3 loop is a cycle in data flow across two independent channels,
//! not in ownership.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod s1;
pub mod s2;
pub mod s3;
pub mod s4;
pub mod s5;
pub mod types;

pub use error::{Result, SubsystemError};
pub use s1::{Operations, S1Config, S1State, WorkRequest, WorkResponse};
pub use s2::{
    Coordination, CoordinationOutcome, CoordinationState, ResolutionStrategy,
    ResourceRequirements, S2Config,
};
pub use s3::{Control, ControlSnapshot, ControlState, InterventionOutcome, ResourceKind, S3Config};
pub use s4::{Intelligence, S4Config, Scenario};
pub use s5::{
    ConstraintPredicate, Decision, Evaluation, Identity, Policy, PolicyConstraint, S5Config,
};
pub use types::{ControlMode, HealthReport, Subsystem};
