//! End-to-end tests: a live scheduler loop interrupted by the atomic switch,
//! with signals fed through the listener channel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use interlock_core::{open_store, DurableStore};
use interlock_discovery::DiscoveryBus;
use interlock_pipeline::{
    stage_fn, OpportunityPipeline, OpportunityState, Signal, Stage, StageHandler, StageOutput,
    StageRouter,
};
use interlock_scheduler::{
    handler_fn, Priority, Scheduler, TaskDefinition, TaskOutcome, TaskStatus, TASK_STATE_KEY,
};
use interlock_switch::{AtomicSwitch, InterlockConfig, PipelineOutcome, SignalDisposition};

const TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(200);

const CONFIG: &str = r#"
    [storage]
    backend = "memory"

    [scheduler]
    tick_interval_ms = 10
    max_concurrent_tasks = 2
    default_task_timeout_ms = 500

    [pipeline]
    filter_confidence_floor = 0.9

    [switch]
    impact_threshold = 0.005
    imminent_window_ms = 500
"#;

fn counting_task(id: &str, priority: Priority, counter: Arc<AtomicU32>) -> TaskDefinition {
    TaskDefinition::new(
        id,
        "scout",
        priority,
        Duration::from_millis(30),
        handler_fn(move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                TaskOutcome::discovery("tick", json!({ "task": ctx.task_id }), 0.8)
            }
        }),
    )
}

fn accept(confidence: f64) -> Arc<dyn StageHandler> {
    stage_fn(move |input| async move { Ok(StageOutput::accept(confidence, input.payload)) })
}

#[tokio::test]
async fn switch_interrupts_live_scheduler() {
    let config = InterlockConfig::from_toml(CONFIG).unwrap();
    let store = open_store(&config.storage).unwrap();
    let bus = Arc::new(DiscoveryBus::with_store(config.discovery.clone(), store.clone()));
    let scheduler = Arc::new(Scheduler::with_bus(config.scheduler.clone(), bus.clone()));

    let scans = Arc::new(AtomicU32::new(0));
    let quotes = Arc::new(AtomicU32::new(0));
    scheduler.register(counting_task("scan", Priority::High, scans.clone())).unwrap();
    scheduler.register(counting_task("quote", Priority::Medium, quotes.clone())).unwrap();

    // Execute records how many task starts happened while it was running.
    let observed = Arc::new(Mutex::new(None));
    let execute = {
        let scheduler = scheduler.clone();
        let scans = scans.clone();
        let observed = observed.clone();
        stage_fn(move |input| {
            let scheduler = scheduler.clone();
            let scans = scans.clone();
            let observed = observed.clone();
            async move {
                let before = scans.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(120)).await;
                let after = scans.load(Ordering::SeqCst);
                let status = scheduler.task("scan").map(|t| t.status);
                *observed.lock().unwrap() = Some((after - before, status));
                Ok(StageOutput::accept(1.0, json!({ "filled": input.payload })))
            }
        })
    };
    let router = StageRouter::new()
        .default_route(Stage::Spot, accept(0.99))
        .default_route(Stage::Validate, accept(0.97))
        .default_route(Stage::Filter, accept(0.95))
        .default_route(Stage::Execute, execute);
    let pipeline = Arc::new(OpportunityPipeline::new(config.pipeline.clone(), router));
    let switch = Arc::new(AtomicSwitch::new(config.switch.clone(), scheduler.clone(), pipeline));

    let run_loop = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });
    tokio::time::sleep(SETTLE).await;
    assert!(scans.load(Ordering::SeqCst) > 0);

    let (tx, rx) = mpsc::channel(8);
    let listener = switch.spawn_listener(rx);
    tx.send(Signal::new("mempool", 0.02, json!({ "pair": "ETH/USDC" }))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    tx.send(Signal::new("bridge", 0.03, json!({}))).await.unwrap();
    drop(tx);
    timeout(TIMEOUT, listener).await.unwrap().unwrap();

    let (starts_during_execute, status_during_execute) = observed.lock().unwrap().unwrap();
    assert_eq!(starts_during_execute, 0);
    assert_eq!(status_during_execute, Some(TaskStatus::Paused));

    let reports = switch.recent_reports(5);
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.paused.iter().any(|id| id == "scan"));
    assert_eq!(report.coalesced.len(), 1);
    assert!(report.fault.is_none());
    match report.outcome.as_ref().unwrap() {
        PipelineOutcome::Completed { opportunity } => {
            assert_eq!(opportunity.state(), Some(OpportunityState::Executed));
            assert!(opportunity.executed_successfully());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // Scheduling carries on once the switch is over.
    let resumed_at = scans.load(Ordering::SeqCst);
    tokio::time::sleep(SETTLE).await;
    assert!(scans.load(Ordering::SeqCst) > resumed_at);
    assert!(quotes.load(Ordering::SeqCst) > 0);
    assert!(!bus.history().is_empty());

    scheduler.shutdown();
    timeout(TIMEOUT, run_loop).await.unwrap().unwrap();
    assert!(scheduler.drain(TIMEOUT).await);

    scheduler.persist_state(store.as_ref()).await.unwrap();
    let saved = store.load_latest(TASK_STATE_KEY).await.unwrap().unwrap();
    assert_eq!(saved.as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn low_confidence_signal_is_rejected_without_fault() {
    let config = InterlockConfig::from_toml(CONFIG).unwrap();
    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
    let runs = Arc::new(AtomicU32::new(0));
    scheduler.register(counting_task("scan", Priority::High, runs)).unwrap();

    let router = StageRouter::new()
        .default_route(Stage::Spot, accept(0.99))
        .default_route(Stage::Validate, accept(0.97))
        .default_route(Stage::Filter, accept(0.5))
        .default_route(Stage::Execute, accept(1.0));
    let pipeline = Arc::new(OpportunityPipeline::new(config.pipeline.clone(), router));
    let switch = AtomicSwitch::new(config.switch.clone(), scheduler.clone(), pipeline);

    let disposition = switch.on_signal(Signal::new("mempool", 0.01, json!({}))).await;
    let SignalDisposition::Switched(report) = disposition else {
        panic!("expected a switch");
    };
    let opportunity = report.outcome.as_ref().and_then(PipelineOutcome::opportunity).unwrap();
    assert_eq!(opportunity.state(), Some(OpportunityState::Rejected));
    assert_eq!(opportunity.rejected_at(), Some(Stage::Filter));
    assert!(report.fault.is_none());
    assert_eq!(scheduler.task("scan").unwrap().status, TaskStatus::Idle);
}
