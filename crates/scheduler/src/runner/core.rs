use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tracing::info;

use interlock_core::TaskId;
use interlock_discovery::DiscoveryBus;

use crate::error::RegistryError;
use crate::metrics::SchedulerMetrics;
use crate::registry::{TaskRegistry, TaskView};
use crate::task::TaskDefinition;
use crate::types::{RunRecord, SchedulerConfig, TaskStatus};

use super::execution::TaskRunner;

/// The task scheduler. Admits due tasks by priority under a fixed number of
/// concurrency slots and runs each through a [`TaskRunner`].
///
/// Built once in the composition root and shared as `Arc<Scheduler>`.
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) registry: Arc<TaskRegistry>,
    /// One permit per concurrency slot.
    pub(super) slots: Arc<Semaphore>,
    pub(super) slot_count: usize,
    pub(super) runner: TaskRunner,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(super) shutdown: Arc<AtomicBool>,
    pub(super) shutdown_notify: Arc<Notify>,
}

impl Scheduler {
    /// Create a scheduler that does not publish discoveries.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a scheduler that publishes `Discovery` outcomes on `bus`.
    pub fn with_bus(config: SchedulerConfig, bus: Arc<DiscoveryBus>) -> Self {
        Self::build(config, Some(bus))
    }

    fn build(config: SchedulerConfig, bus: Option<Arc<DiscoveryBus>>) -> Self {
        let slot_count = config.resolved_max_concurrent();
        let registry = Arc::new(TaskRegistry::new(config.history_capacity));
        let metrics = Arc::new(RwLock::new(SchedulerMetrics::default()));
        let runner = TaskRunner::new(
            Arc::clone(&registry),
            bus,
            Arc::clone(&metrics),
            config.resolved_failure_threshold(),
            config.default_task_timeout(),
        );
        Self {
            config,
            registry,
            slots: Arc::new(Semaphore::new(slot_count)),
            slot_count,
            runner,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register a periodic task. Fails on an empty id, a zero interval, or an
    /// id that is already taken; the registry is unchanged on failure.
    pub fn register(&self, definition: TaskDefinition) -> Result<TaskId, RegistryError> {
        self.registry.register(definition, Utc::now())
    }

    /// Stop scheduling a task. Its state and history stay readable.
    pub fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.deregister(id)
    }

    /// Bring a Failed task back to Idle, due immediately.
    pub fn reset_task(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.reset(id, Utc::now())
    }

    /// Defer a task's next admission. An in-flight invocation keeps running.
    pub fn pause_task(&self, id: &str) -> Result<TaskStatus, RegistryError> {
        self.registry.pause(id)
    }

    /// Undo [`pause_task`](Self::pause_task) with timing exactly as before.
    pub fn resume_task(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.resume(id)
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn task(&self, id: &str) -> Option<TaskView> {
        self.registry.get(id)
    }

    pub fn list_active(&self) -> Vec<TaskView> {
        self.registry.list_active()
    }

    pub fn history(&self, id: &str) -> Option<Vec<RunRecord>> {
        self.registry.history(id)
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Slots not held by an in-flight invocation.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Signal the tick loop and snapshot loop to stop.
    pub fn shutdown(&self) {
        info!("Scheduler shutdown requested");
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
