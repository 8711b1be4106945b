use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use interlock_core::{panic_message, TaskId};
use interlock_discovery::{Discovery, DiscoveryBus};

use crate::metrics::SchedulerMetrics;
use crate::registry::{Invocation, RunApplied, TaskRegistry};
use crate::task::TaskOutcome;
use crate::types::{RunKind, RunRecord};

use super::Scheduler;

impl Scheduler {
    /// Run the tick loop. Returns once [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        info!(
            slots = self.slot_count,
            tasks = self.registry.len(),
            tick_ms = self.config.tick_interval().as_millis() as u64,
            "Scheduler starting"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.is_shutdown() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = self.shutdown_notify.notified() => break,
            }
        }

        info!("Scheduler stopped");
    }

    /// Wait until every slot is free, or `timeout` elapses. Returns whether
    /// the scheduler drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.slot_count).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.slots.acquire_many(all)).await {
            // The permits are returned as soon as the guard drops.
            Ok(_) => true,
            Err(_) => {
                warn!(
                    busy = self.slot_count.saturating_sub(self.slots.available_permits()),
                    timeout_ms = timeout.as_millis() as u64,
                    "Drain timed out with tasks still running"
                );
                false
            }
        }
    }
}

/// Outcome of one [`TaskRunner::run`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub task_id: TaskId,
    pub generation: u64,
    pub kind: RunKind,
    pub duration: Duration,
    pub applied: RunApplied,
}

/// Executes one admitted invocation: timeout, panic capture, state update,
/// and discovery publishing.
#[derive(Clone)]
pub struct TaskRunner {
    registry: Arc<TaskRegistry>,
    bus: Option<Arc<DiscoveryBus>>,
    metrics: Arc<RwLock<SchedulerMetrics>>,
    failure_threshold: u32,
    default_timeout: Duration,
}

impl TaskRunner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        bus: Option<Arc<DiscoveryBus>>,
        metrics: Arc<RwLock<SchedulerMetrics>>,
        failure_threshold: u32,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            bus,
            metrics,
            failure_threshold,
            default_timeout,
        }
    }

    /// Run the handler in its own tokio task, bounded by the task's timeout.
    ///
    /// The slot `permit` is released when this returns. On timeout the
    /// handler is left to finish in the background and its result is
    /// discarded.
    #[instrument(skip_all, fields(task_id = %invocation.task_id, generation = invocation.generation))]
    pub async fn run(&self, invocation: Invocation, permit: OwnedSemaphorePermit) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let limit = invocation.timeout.unwrap_or(self.default_timeout);

        let handler = Arc::clone(&invocation.handler);
        let ctx = invocation.context(started_at);
        let mut handle = tokio::spawn(async move { handler.run(ctx).await });

        let report = match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(outcome)) => {
                let report = self.finish(
                    &invocation,
                    started_at,
                    clock.elapsed(),
                    outcome.kind(),
                    outcome.message(),
                    false,
                );
                if report.applied != RunApplied::Stale {
                    self.publish(&invocation, outcome);
                }
                report
            }
            Ok(Err(join_error)) => {
                let (kind, message) = describe_join_error(join_error);
                self.finish(&invocation, started_at, clock.elapsed(), kind, Some(message), false)
            }
            Err(_) => {
                let message = format!("timed out after {}ms", limit.as_millis());
                let report = self.finish(
                    &invocation,
                    started_at,
                    clock.elapsed(),
                    RunKind::TimedOut,
                    Some(message),
                    true,
                );
                self.spawn_reaper(&invocation, started_at, clock, handle);
                report
            }
        };

        drop(permit);
        report
    }

    fn finish(
        &self,
        invocation: &Invocation,
        started_at: DateTime<Utc>,
        duration: Duration,
        kind: RunKind,
        message: Option<String>,
        abandoned: bool,
    ) -> RunReport {
        let record = RunRecord {
            generation: invocation.generation,
            started_at,
            finished_at: Utc::now(),
            duration,
            kind,
            message: message.clone(),
        };
        let task_id = invocation.task_id.as_str();
        let applied = if abandoned {
            self.registry
                .abandon_run(task_id, invocation.generation, record, self.failure_threshold)
        } else {
            self.registry
                .complete_run(task_id, invocation.generation, record, self.failure_threshold)
        };

        let elapsed_ms = duration.as_millis() as u64;
        if applied == RunApplied::Stale {
            self.count_stale();
        } else {
            self.metrics
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .record_execution(task_id, duration, kind);
            if kind.is_failure() {
                warn!(
                    task_id,
                    kind = ?kind,
                    elapsed_ms,
                    error = message.as_deref().unwrap_or(""),
                    "Task invocation failed"
                );
            } else {
                debug!(task_id, kind = ?kind, elapsed_ms, "Task invocation completed");
            }
        }

        RunReport {
            task_id: invocation.task_id.clone(),
            generation: invocation.generation,
            kind,
            duration,
            applied,
        }
    }

    fn publish(&self, invocation: &Invocation, outcome: TaskOutcome) {
        let TaskOutcome::Discovery {
            kind,
            data,
            confidence,
        } = outcome
        else {
            return;
        };
        let Some(bus) = &self.bus else {
            debug!(task_id = %invocation.task_id, kind = %kind, "No discovery bus, dropping discovery");
            return;
        };

        let discovery = Discovery::new(
            kind,
            data,
            confidence,
            invocation.task_id.clone(),
            invocation.agent_id.clone(),
        );
        let delivery = bus.publish(discovery);
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .discoveries_published += 1;
        debug!(
            task_id = %invocation.task_id,
            delivered = delivery.delivered,
            failed = delivery.failed.len(),
            "Published discovery"
        );
    }

    /// Await an abandoned handler and push its result through the
    /// generation guard, which discards it.
    fn spawn_reaper(
        &self,
        invocation: &Invocation,
        started_at: DateTime<Utc>,
        clock: Instant,
        handle: JoinHandle<TaskOutcome>,
    ) {
        let runner = self.clone();
        let task_id = invocation.task_id.clone();
        let generation = invocation.generation;
        tokio::spawn(async move {
            let (kind, message) = match handle.await {
                Ok(outcome) => (outcome.kind(), outcome.message()),
                Err(join_error) => {
                    let (kind, message) = describe_join_error(join_error);
                    (kind, Some(message))
                }
            };
            let record = RunRecord {
                generation,
                started_at,
                finished_at: Utc::now(),
                duration: clock.elapsed(),
                kind,
                message,
            };
            let applied =
                runner
                    .registry
                    .complete_run(&task_id, generation, record, runner.failure_threshold);
            if applied == RunApplied::Stale {
                runner.count_stale();
                debug!(task_id = %task_id, generation, "Discarded late result of abandoned invocation");
            }
        });
    }

    fn count_stale(&self) {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .stale_results_discarded += 1;
    }
}

fn describe_join_error(error: JoinError) -> (RunKind, String) {
    if error.is_panic() {
        let payload = error.into_panic();
        (RunKind::Panicked, format!("handler panicked: {}", panic_message(payload.as_ref())))
    } else {
        (RunKind::Failure, "handler task was cancelled".to_string())
    }
}
