//! VSM runtime CLI
//!
//! Exit codes: 0 normal, 2 viability failure, 3 configuration error.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use vsm::config::{load_config, VsmConfig};
use vsm::consensus::BeliefMeta;
use vsm::core::VsmLevel;
use vsm::supervisor::Runtime;

/// Self-regulating runtime organized as a Viable System Model
#[derive(Parser)]
#[command(name = "vsm", version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true, env = "VSM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the supervisor and run until interrupted
    Run,
    /// Boot briefly and dump the last health of each subsystem
    Health,
    /// Authoritatively install a belief at one level
    ForceConsensus {
        /// VSM level (s1..s5)
        level: String,
        /// Belief content
        belief: String,
    },
    /// Fire an emergency scream through the algedonic bypass
    EmergencyScream {
        /// Signal source
        source: String,
        /// Reason text
        reason: String,
    },
}

fn main() -> ExitCode {
    if let Err(e) = vsm::telemetry::init_tracing() {
        eprintln!("warning: failed to initialize tracing: {}", e);
    }

    let cli = Cli::parse();
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            eprintln!("configuration error: {}", e);
            return ExitCode::from(3);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build();
    let runtime = match runtime {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {}", e);
            return ExitCode::from(2);
        }
    };

    runtime.block_on(async move {
        match cli.command {
            Command::Run => run(config).await,
            Command::Health => health(config).await,
            Command::ForceConsensus { level, belief } => force_consensus(config, level, belief),
            Command::EmergencyScream { source, reason } => {
                emergency_scream(config, source, reason).await
            }
        }
    })
}

async fn run(config: VsmConfig) -> ExitCode {
    let runtime = match Runtime::build(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::from(2);
        }
    };
    let _rotation = runtime.metrics.spawn_rotation(Duration::from_secs(30));
    for stats in runtime.pools.stats() {
        if let Some(pool) = runtime.pools.get(&stats.name) {
            let _ = pool.spawn_health_checks();
        }
    }

    let (supervisor, handle) = runtime.supervisor();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            handle.shutdown();
        }
    });

    match supervisor.supervise().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "supervisor exited");
            ExitCode::from(2)
        }
    }
}

async fn health(config: VsmConfig) -> ExitCode {
    let runtime = match Runtime::build(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::from(2);
        }
    };

    let (supervisor, handle) = runtime.supervisor();
    let supervise = tokio::spawn(supervisor.supervise());

    // Let two health rounds land before reading
    tokio::time::sleep(Duration::from_millis(2500)).await;

    println!("subsystem health:");
    for (name, health) in runtime.health_snapshot().await {
        println!("  {:<4} {:.3}", name, health);
    }
    let heard = runtime.algedonic.subsystem_health();
    if !heard.is_empty() {
        println!("algedonic view:");
        for (name, health) in heard {
            println!("  {:<4} {:.3}", name, health);
        }
    }
    let snapshot = runtime.metrics.snapshot();
    println!("counters:");
    for (key, value) in snapshot.counters {
        println!("  {:<32} {}", key, value);
    }

    handle.shutdown();
    match supervise.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        _ => ExitCode::from(2),
    }
}

fn force_consensus(config: VsmConfig, level: String, belief: String) -> ExitCode {
    let runtime = match Runtime::build(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::from(2);
        }
    };

    let level: VsmLevel = match level.parse() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("configuration error: unknown level {:?} (expected s1..s5)", level);
            return ExitCode::from(3);
        }
    };

    let meta = BeliefMeta {
        weight: 1.0,
        confidence: 1.0,
        ..BeliefMeta::default()
    };
    match runtime.consensus.force_consensus(level, vec![(belief, meta)]) {
        Ok(ids) => {
            for id in ids {
                println!("forced belief {}", id);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "force-consensus failed");
            ExitCode::from(2)
        }
    }
}

async fn emergency_scream(config: VsmConfig, source: String, reason: String) -> ExitCode {
    let runtime = match Runtime::build(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::from(2);
        }
    };

    runtime.algedonic.emergency_scream(&source, &reason);
    // Give the bus a beat to fan the signal out
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("emergency scream published from {:?}: {}", source, reason);
    ExitCode::SUCCESS
}
