//! interlock-worker: runs the scheduler, discovery bus, and atomic switch
//! in one process.
//!
//! Signals arrive as JSON lines on stdin:
//!
//! ```text
//! {"source":"mempool","impact_score":0.012,"payload":{"tx":"0xabc"}}
//! ```
//!
//! Runs until Ctrl-C or SIGTERM, then drains in-flight tasks, flushes
//! discovery history, and persists task state. Closing stdin only stops
//! signal intake.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use interlock_core::open_store;
use interlock_discovery::DiscoveryBus;
use interlock_pipeline::{
    stage_fn, OpportunityPipeline, Signal, Stage, StageHandler, StageOutput, StageRouter,
};
use interlock_scheduler::{handler_fn, Priority, Scheduler, TaskDefinition, TaskOutcome};
use interlock_switch::{AtomicSwitch, InterlockConfig};

// ── CLI ─────────────────────────────────────────────────────────────

/// Priority task scheduler with an atomic interrupt switch.
#[derive(Parser, Debug)]
#[command(name = "interlock-worker", version, about)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, env = "INTERLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for the file store (overrides config).
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Heartbeat task interval in seconds.
    #[arg(long, env = "INTERLOCK_HEARTBEAT_INTERVAL", default_value_t = 30)]
    heartbeat_interval: u64,

    /// Seconds to wait for in-flight tasks at shutdown.
    #[arg(long, env = "INTERLOCK_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,

    /// Signal channel capacity.
    #[arg(long, default_value_t = 256)]
    signal_buffer: usize,
}

// ── Stage handlers ──────────────────────────────────────────────────

/// Accepts the opportunity unchanged, carrying the prior confidence forward.
fn passthrough(stage: Stage) -> Arc<dyn StageHandler> {
    stage_fn(move |input| async move {
        debug!(%stage, opportunity_id = %input.opportunity_id, "passthrough stage");
        Ok(StageOutput::accept(input.prior_confidence, input.payload))
    })
}

/// Logs the opportunity instead of acting on it.
fn dry_run_execute() -> Arc<dyn StageHandler> {
    stage_fn(|input| async move {
        info!(
            opportunity_id = %input.opportunity_id,
            routing_key = %input.routing_key,
            confidence = input.prior_confidence,
            "dry-run execute"
        );
        Ok(StageOutput::accept(
            input.prior_confidence,
            json!({ "dry_run": true, "input": input.payload }),
        ))
    })
}

fn default_router() -> StageRouter {
    StageRouter::new()
        .default_route(Stage::Spot, passthrough(Stage::Spot))
        .default_route(Stage::Validate, passthrough(Stage::Validate))
        .default_route(Stage::Filter, passthrough(Stage::Filter))
        .default_route(Stage::Execute, dry_run_execute())
}

// ── Signal intake ───────────────────────────────────────────────────

/// Forward JSON-line signals from stdin until EOF or the receiver closes.
async fn read_signals(tx: mpsc::Sender<Signal>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Signal>(line) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed signal line"),
                }
            }
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to read stdin");
                break;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Await a background task, logging a panic or cancellation. Returns
/// whether it ended cleanly.
async fn join_background(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(task = name, error = %e, "background task ended abnormally");
            false
        }
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = InterlockConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }
    let store = open_store(&config.storage)?;

    let bus = Arc::new(DiscoveryBus::with_store(config.discovery.clone(), store.clone()));
    match bus.restore().await {
        Ok(count) => info!(count, "discovery history restored"),
        Err(e) => warn!(error = %e, "could not restore discovery history, starting empty"),
    }
    bus.subscribe_fn("log", |discovery| {
        info!(
            kind = discovery.kind(),
            source_task = discovery.source_task(),
            confidence = discovery.confidence(),
            "discovery"
        );
        Ok(())
    });

    let scheduler = Arc::new(Scheduler::with_bus(config.scheduler.clone(), bus.clone()));
    scheduler.register(
        TaskDefinition::new(
            "heartbeat",
            "interlock",
            Priority::Low,
            Duration::from_secs(cli.heartbeat_interval.max(1)),
            handler_fn(|ctx| async move {
                debug!(generation = ctx.generation, "heartbeat");
                TaskOutcome::success()
            }),
        )
        .with_name("Heartbeat"),
    )?;
    match scheduler.restore_state(store.as_ref()).await {
        Ok(count) => info!(count, "task state restored"),
        Err(e) => warn!(error = %e, "could not restore task state"),
    }

    let pipeline = Arc::new(OpportunityPipeline::new(config.pipeline.clone(), default_router()));
    let switch = Arc::new(AtomicSwitch::new(
        config.switch.clone(),
        scheduler.clone(),
        pipeline,
    ));

    let (tx, rx) = mpsc::channel(cli.signal_buffer.max(1));
    let listener = switch.spawn_listener(rx);
    let reader = tokio::spawn(read_signals(tx));

    let run_loop = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });
    let flush_loop = bus.spawn_flush_loop();
    let snapshot_loop =
        scheduler.spawn_snapshot_loop(store.clone(), config.scheduler.snapshot_interval());

    info!(
        slots = scheduler.slot_count(),
        impact_threshold = config.switch.impact_threshold,
        "interlock-worker started"
    );

    shutdown_signal().await;
    info!("shutdown requested");

    reader.abort();
    scheduler.shutdown();
    join_background("scheduler loop", run_loop).await;

    if !scheduler.drain(Duration::from_secs(cli.shutdown_timeout)).await {
        warn!("in-flight tasks did not finish before the shutdown timeout");
    }
    join_background("signal listener", listener).await;

    bus.shutdown();
    join_background("discovery flush loop", flush_loop).await;
    join_background("task state snapshot loop", snapshot_loop).await;

    let m = switch.metrics();
    info!(
        switches = m.switches,
        coalesced = m.coalesced,
        budget_overruns = m.budget_overruns,
        emergency_resumes = m.emergency_resumes,
        "interlock-worker exited cleanly"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_background_reports_abnormal_exit() {
        assert!(join_background("clean", tokio::spawn(async {})).await);
        assert!(!join_background("panicking", tokio::spawn(async { panic!("loop died") })).await);

        let stuck = tokio::spawn(std::future::pending::<()>());
        stuck.abort();
        assert!(!join_background("aborted", stuck).await);
    }
}
