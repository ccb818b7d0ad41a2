//! # VSM Channels - Variety Conduits and the Algedonic Bypass
//!
//! Two kinds of inter-subsystem plumbing:
//!
//! - [`variety`]: the six directed, bounded channels of the viable system,
//!   each applying one attenuation or amplification transform
//! - [`algedonic`]: the cross-cutting pain/pleasure bypass with hedonic
//!   adaptation, emergency screams, and the dead-subsystem detector
//!
//! Channels never share mutable state with their endpoints; subsystems
//! own their side of the conversation and everything else rides the bus.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod algedonic;
pub mod error;
pub mod variety;

pub use algedonic::{
    AlgedonicChannel, AlgedonicConfig, AlgedonicState, HedonicConfig, HedonicEngine, Severity,
    Signal,
};
pub use error::{ChannelError, Result};
pub use variety::{
    ChannelKind, ChannelSet, ChannelStats, VarietyChannel, VarietyPacket, VarietyType,
};
