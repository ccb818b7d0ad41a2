//! # VSM - A Self-Regulating Runtime
//!
//! Implementation of Stafford Beer's Viable System Model as a supervised
//! set of tokio actors. Five control subsystems (S1 operations, S2
//! coordination, S3 control, S4 intelligence, S5 policy) exchange variety
//! over named channels, and an algedonic bypass carries critical
//! pain/pleasure signals straight to the top of the hierarchy.
//!
//! ## Crate layout
//!
//! - [`vsm_core`]: hybrid logical clock, event bus, tiered metrics
//! - [`vsm_resilience`]: circuit breakers, rate limiting, connection pools
//! - [`vsm_channels`]: variety channels and the algedonic bypass
//! - [`vsm_consensus`]: reputation-weighted belief consensus
//! - [`vsm_subsystems`]: the five subsystems
//! - this crate: configuration, the supervisor, and the CLI
//!
//! ## Example
//!
//! ```rust,no_run
//! use vsm::{config::VsmConfig, supervisor::Runtime};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let runtime = Runtime::build(VsmConfig::default())?;
//! let (supervisor, handle) = runtime.supervisor();
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.shutdown();
//! });
//! supervisor.supervise().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod supervisor;
pub mod telemetry;

pub use config::{load_config, ConfigError, VsmConfig};
pub use supervisor::{Runtime, SupervisorError, SupervisorHandle, VsmSupervisor};

// Re-export the member crates under their roles
pub use vsm_channels as channels;
pub use vsm_consensus as consensus;
pub use vsm_core as core;
pub use vsm_resilience as resilience;
pub use vsm_subsystems as subsystems;
