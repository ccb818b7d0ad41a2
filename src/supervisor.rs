//! # VSM Supervisor and Runtime Wiring
//!
//! The runtime builds the process-wide services (clock, bus, metrics),
//! the six variety channels, the algedonic bypass, belief consensus, the
//! connection pools, and the five subsystems. The supervisor then starts
//! everything in the enforced order — Algedonic → S5 → S4 → S3 → S2 → S1
//! → channels — and keeps the tree viable with one-for-one restarts.
//!
//! Exceeding the restart budget publishes `vsm_failure`, screams through
//! the algedonic bypass, and terminates with a viability error.

use crate::config::VsmConfig;
use anyhow::Context;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use vsm_channels::{AlgedonicChannel, ChannelKind, ChannelSet};
use vsm_consensus::ConsensusService;
use vsm_core::{topics, EventBus, HybridLogicalClock, MetricsRegistry};
use vsm_resilience::{ConnectionPool, PoolManager, RateLimiter};
use vsm_subsystems::{
    Control, Coordination, Intelligence, Operations, Policy, S1Config, S2Config, S3Config,
    S4Config, S5Config, Subsystem,
};

/// Supervision failure (CLI exit code 2)
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The system can no longer be kept viable
    #[error("viability failure: {0}")]
    Viability(String),
}

/// Everything the process runs, wired but not yet started
pub struct Runtime {
    /// Loaded configuration
    pub config: VsmConfig,
    /// Process-wide clock
    pub clock: Arc<HybridLogicalClock>,
    /// Shared metrics registry
    pub metrics: Arc<MetricsRegistry>,
    /// Process-wide bus
    pub bus: Arc<EventBus>,
    /// Shared rate limiter
    pub limiter: Arc<RateLimiter>,
    /// The six variety channels
    pub channels: Arc<ChannelSet>,
    /// The algedonic bypass
    pub algedonic: Arc<AlgedonicChannel>,
    /// Belief consensus service
    pub consensus: Arc<ConsensusService>,
    /// Named connection pools
    pub pools: Arc<PoolManager>,
    /// S1 operations
    pub s1: Arc<Operations>,
    /// S2 coordination
    pub s2: Arc<Coordination>,
    /// S3 control
    pub s3: Arc<Control>,
    /// S4 intelligence
    pub s4: Arc<Intelligence>,
    /// S5 policy
    pub s5: Arc<Policy>,
}

impl Runtime {
    /// Build the full runtime from configuration
    pub fn build(config: VsmConfig) -> anyhow::Result<Self> {
        let clock = Arc::new(match &config.node_id {
            Some(id) => HybridLogicalClock::new(id.clone()),
            None => HybridLogicalClock::with_hostname(),
        });

        let metrics = Arc::new(match &config.data_dir {
            Some(dir) => MetricsRegistry::with_warm_tier(dir.join("metrics"))
                .context("opening warm metrics tier")?,
            None => MetricsRegistry::new(),
        });

        let bus = Arc::new(EventBus::new(Arc::clone(&clock), Arc::clone(&metrics)));
        let limiter = Arc::new(
            RateLimiter::new(config.ratelimiter_config()).with_bus(Arc::clone(&bus)),
        );
        let channels = Arc::new(ChannelSet::new(&bus, config.channel.capacity));
        let algedonic = Arc::new(AlgedonicChannel::new(
            Arc::clone(&bus),
            Arc::clone(&clock),
            config.algedonic_config(),
        ));

        let belief_db = match &config.data_dir {
            Some(dir) => Some(sled::open(dir.join("beliefs")).context("opening belief store")?),
            None => None,
        };
        let consensus = Arc::new(
            ConsensusService::new(
                Arc::clone(&bus),
                Arc::clone(&clock),
                config.consensus_config(),
                belief_db.as_ref(),
            )
            .context("building consensus service")?,
        );

        let pools = Arc::new(PoolManager::new());
        for (name, pool_config) in config.pool_configs() {
            let pool = ConnectionPool::new(name, pool_config)
                .context("building connection pool")?
                .with_bus(Arc::clone(&bus));
            pools.register(Arc::new(pool));
        }

        let s1 = Arc::new(Operations::new(
            S1Config {
                breaker: config.breaker_config(),
                pain_threshold: config.algedonic.pain,
                ..S1Config::default()
            },
            Arc::clone(&bus),
            channels.get(ChannelKind::S1ToS2),
            Arc::clone(&limiter),
        ));
        let s2 = Arc::new(Coordination::new(
            S2Config::default(),
            Arc::clone(&bus),
            channels.get(ChannelKind::S1ToS2),
            channels.get(ChannelKind::S2ToS3),
        ));
        let s3 = Arc::new(Control::new(
            S3Config::default(),
            Arc::clone(&bus),
            channels.get(ChannelKind::S2ToS3),
            channels.get(ChannelKind::S3ToS1),
            channels.get(ChannelKind::S3ToS4),
        ));
        let s4 = Arc::new(Intelligence::new(
            S4Config::default(),
            Arc::clone(&bus),
            channels.get(ChannelKind::S3ToS4),
            channels.get(ChannelKind::S4ToS5),
        ));
        let s5 = Arc::new(Policy::new(
            S5Config::default(),
            Arc::clone(&bus),
            channels.get(ChannelKind::S5ToAll),
            channels.get(ChannelKind::S4ToS5),
        ));

        Ok(Self {
            config,
            clock,
            metrics,
            bus,
            limiter,
            channels,
            algedonic,
            consensus,
            pools,
            s1,
            s2,
            s3,
            s4,
            s5,
        })
    }

    /// Health of each subsystem plus what the algedonic channel has heard
    pub async fn health_snapshot(&self) -> Vec<(String, f64)> {
        let mut snapshot = Vec::new();
        snapshot.push(("s1".to_string(), self.s1.health().await));
        snapshot.push(("s2".to_string(), self.s2.health().await));
        snapshot.push(("s3".to_string(), self.s3.health().await));
        snapshot.push(("s4".to_string(), self.s4.health().await));
        snapshot.push(("s5".to_string(), self.s5.health().await));
        snapshot
    }

    /// Assemble the supervisor over this runtime
    pub fn supervisor(&self) -> (VsmSupervisor, SupervisorHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let specs: Vec<(&'static str, ChildFactory)> = vec![
            ("algedonic", child(Arc::clone(&self.algedonic), |a, rx| a.run(rx))),
            ("s5", subsystem_child(Arc::clone(&self.s5))),
            ("s4", subsystem_child(Arc::clone(&self.s4))),
            ("s3", subsystem_child(Arc::clone(&self.s3))),
            ("s2", subsystem_child(Arc::clone(&self.s2))),
            ("s1", subsystem_child(Arc::clone(&self.s1))),
            ("consensus", child(Arc::clone(&self.consensus), |c, rx| c.run(rx))),
        ];

        let restart_count = Arc::new(AtomicU64::new(0));
        let supervisor = VsmSupervisor {
            max_restarts: self.config.vsm.max_restarts,
            restart_window: Duration::from_secs(self.config.vsm.restart_window_sec),
            bus: Arc::clone(&self.bus),
            algedonic: Arc::clone(&self.algedonic),
            channels: Arc::clone(&self.channels),
            pools: Arc::clone(&self.pools),
            specs,
            children: Vec::new(),
            restart_count: Arc::clone(&restart_count),
            shutdown_tx: shutdown_tx.clone(),
            shutdown_rx,
            cmd_rx,
        };
        (
            supervisor,
            SupervisorHandle {
                shutdown_tx,
                cmd_tx,
                restart_count,
            },
        )
    }
}

type ChildFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
type ChildFactory = Box<dyn Fn(watch::Receiver<bool>) -> ChildFuture + Send + Sync>;

fn child<T, F, Fut>(target: Arc<T>, run: F) -> ChildFactory
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Box::new(move |rx| {
        let target = Arc::clone(&target);
        let fut = run(target, rx);
        Box::pin(fut)
    })
}

fn subsystem_child<S: Subsystem + 'static>(subsystem: Arc<S>) -> ChildFactory {
    Box::new(move |rx| {
        let subsystem = Arc::clone(&subsystem);
        Box::pin(async move {
            if let Err(e) = subsystem.run(rx).await {
                error!(error = %e, "subsystem task failed");
            }
        })
    })
}

struct Child {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Commands accepted by a running supervisor
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Abort one child by name (it will be restarted, budget permitting)
    Kill(&'static str),
}

/// Control handle over a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    shutdown_tx: watch::Sender<bool>,
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    restart_count: Arc<AtomicU64>,
}

impl SupervisorHandle {
    /// Request a graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Abort one child (used by fault-injection tests and operators)
    pub async fn kill(&self, name: &'static str) {
        let _ = self.cmd_tx.send(SupervisorCommand::Kill(name)).await;
    }

    /// Restarts performed since boot
    pub fn restarts(&self) -> u64 {
        self.restart_count.load(Ordering::Relaxed)
    }
}

/// One-for-one supervisor over the VSM tree
pub struct VsmSupervisor {
    max_restarts: u32,
    restart_window: Duration,
    bus: Arc<EventBus>,
    algedonic: Arc<AlgedonicChannel>,
    channels: Arc<ChannelSet>,
    pools: Arc<PoolManager>,
    specs: Vec<(&'static str, ChildFactory)>,
    children: Vec<Child>,
    restart_count: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    cmd_rx: mpsc::Receiver<SupervisorCommand>,
}

impl VsmSupervisor {
    /// Start the tree in order, validate viability, then supervise until
    /// shutdown or viability failure
    pub async fn supervise(mut self) -> Result<(), SupervisorError> {
        // Enforced boot order: the specs vector is already ordered
        for (name, factory) in &self.specs {
            info!(child = name, "starting");
            let handle = tokio::spawn(factory(self.shutdown_rx.clone()));
            self.children.push(Child { name, handle });
        }
        for pool in self.pools.stats() {
            info!(pool = %pool.name, "connection pool registered");
        }

        // Channels come last; validate the full wiring before declaring
        // the system viable
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.channels
            .validate()
            .map_err(|e| self.fail(format!("channel validation failed: {}", e)))?;
        if let Some(dead) = self.children.iter().find(|c| c.handle.is_finished()) {
            let reason = format!("{} died during boot", dead.name);
            return Err(self.fail(reason));
        }

        let names: Vec<&str> = self.children.iter().map(|c| c.name).collect();
        let _ = self.bus.publish_critical(
            topics::VSM_VIABLE,
            "vsm_supervisor",
            serde_json::json!({ "subsystems": names }),
        );
        info!("VSM viable: all subsystems and channels live");

        let mut system_shutdown = self
            .bus
            .subscribe(topics::SYSTEM_SHUTDOWN)
            .map_err(|e| SupervisorError::Viability(e.to_string()))?;
        let mut restarts: VecDeque<Instant> = VecDeque::new();

        enum Wake {
            ChildExited(usize, Option<String>),
            Kill(Option<SupervisorCommand>),
            SystemShutdown(Option<String>),
            External,
        }

        loop {
            // Select arms only capture their bound values; all state
            // changes happen below, after the branch futures are dropped
            let wake = tokio::select! {
                (result, idx, _) = futures::future::select_all(
                    self.children.iter_mut().map(|c| &mut c.handle),
                ) => Wake::ChildExited(idx, result.err().map(|e| e.to_string())),
                cmd = self.cmd_rx.recv() => Wake::Kill(cmd),
                event = system_shutdown.recv() => Wake::SystemShutdown(
                    event
                        .and_then(|e| e.data.get("reason").cloned())
                        .and_then(|r| r.as_str().map(String::from)),
                ),
                _ = self.shutdown_rx.changed() => Wake::External,
            };

            let idx = match wake {
                Wake::ChildExited(idx, error) => {
                    if *self.shutdown_rx.borrow() {
                        // Children already unwinding; finish the shutdown
                        self.shutdown_children("requested").await;
                        return Ok(());
                    }
                    match error {
                        None => warn!(child = self.children[idx].name, "child stopped unexpectedly"),
                        Some(e) => warn!(child = self.children[idx].name, error = %e, "child crashed"),
                    }
                    idx
                }
                Wake::Kill(Some(SupervisorCommand::Kill(name))) => {
                    if let Some(child) = self.children.iter().find(|c| c.name == name) {
                        warn!(child = name, "kill requested");
                        child.handle.abort();
                    }
                    continue;
                }
                Wake::Kill(None) => continue,
                Wake::SystemShutdown(reason) => {
                    let reason = reason.unwrap_or_else(|| "unknown".to_string());
                    error!(reason, "system shutdown requested");
                    self.shutdown_children(&reason).await;
                    return Err(SupervisorError::Viability(reason));
                }
                Wake::External => {
                    if *self.shutdown_rx.borrow() {
                        self.shutdown_children("requested").await;
                        return Ok(());
                    }
                    continue;
                }
            };

            let now = Instant::now();
            restarts.push_back(now);
            while let Some(front) = restarts.front() {
                if now.duration_since(*front) > self.restart_window {
                    restarts.pop_front();
                } else {
                    break;
                }
            }

            if restarts.len() >= self.max_restarts as usize {
                let reason = format!(
                    "{} restarts within {:?}",
                    restarts.len(),
                    self.restart_window
                );
                let name = self.children[idx].name;
                error!(child = name, reason, "restart budget exhausted");
                let err = self.fail(reason);
                self.shutdown_children("viability lost").await;
                return Err(err);
            }

            // One-for-one: only the crashed child restarts
            let name = self.children[idx].name;
            let Some((_, factory)) = self
                .specs
                .iter()
                .find(|(spec_name, _)| *spec_name == name)
            else {
                let err = self.fail(format!("no spec for child {}", name));
                self.shutdown_children("supervisor inconsistency").await;
                return Err(err);
            };
            warn!(
                child = name,
                restarts_in_window = restarts.len(),
                "restarting child"
            );
            self.bus.metrics().incr("supervisor.restarts");
            self.restart_count.fetch_add(1, Ordering::Relaxed);
            self.children[idx].handle = tokio::spawn(factory(self.shutdown_rx.clone()));
        }
    }

    fn fail(&self, reason: String) -> SupervisorError {
        let _ = self.bus.publish_critical(
            topics::VSM_FAILURE,
            "vsm_supervisor",
            serde_json::json!({ "reason": reason.clone() }),
        );
        self.algedonic
            .emergency_scream("vsm_supervisor", "VSM viability lost");
        SupervisorError::Viability(reason)
    }

    async fn shutdown_children(&mut self, reason: &str) {
        let _ = self.bus.publish_critical(
            topics::VSM_SHUTDOWN,
            "vsm_supervisor",
            serde_json::json!({ "reason": reason }),
        );
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + Duration::from_secs(2);
        for child in &mut self.children {
            if child.handle.is_finished() {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut child.handle)
                .await
                .is_err()
            {
                warn!(child = child.name, "forced abort at shutdown");
                child.handle.abort();
            }
        }
        info!(reason, "VSM shut down");
    }
}
