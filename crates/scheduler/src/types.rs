use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use interlock_core::config::profiled_env_parse;

/// Task priority. Declaration order is admission order: `High` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

/// Runtime status of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for `next_run_at`.
    Idle,
    /// Admitted; a handler invocation holds a concurrency slot.
    Running,
    /// Admission deferred until explicitly resumed.
    Paused,
    /// Too many consecutive failures; excluded until reset.
    Failed,
}

/// How a single invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Success,
    Discovery,
    Failure,
    TimedOut,
    Panicked,
}

impl RunKind {
    pub fn is_failure(self) -> bool {
        matches!(self, RunKind::Failure | RunKind::TimedOut | RunKind::Panicked)
    }
}

/// One entry of a task's bounded run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub kind: RunKind,
    /// Summary on success, error text on failure.
    pub message: Option<String>,
}

/// Scheduler configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Milliseconds between scheduler ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Concurrency slots. 0 = available parallelism.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Handler timeout when the task does not override it.
    #[serde(default = "default_task_timeout")]
    pub default_task_timeout_ms: u64,
    /// Consecutive failures that move a task to `Failed`.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Run records retained per task.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Seconds between task-state snapshots to durable storage.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_seconds: u64,
}

fn default_tick_interval() -> u64 { 100 }
fn default_max_concurrent() -> usize { 4 }
fn default_task_timeout() -> u64 { 30_000 }
fn default_failure_threshold() -> u32 { 3 }
fn default_history_capacity() -> usize { 20 }
fn default_snapshot_interval() -> u64 { 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            max_concurrent_tasks: default_max_concurrent(),
            default_task_timeout_ms: default_task_timeout(),
            failure_threshold: default_failure_threshold(),
            history_capacity: default_history_capacity(),
            snapshot_interval_seconds: default_snapshot_interval(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve the slot count (0 means use available parallelism).
    pub fn resolved_max_concurrent(&self) -> usize {
        if self.max_concurrent_tasks == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.max_concurrent_tasks
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }

    /// A threshold of 0 would fail tasks before they ever ran.
    pub fn resolved_failure_threshold(&self) -> u32 {
        self.failure_threshold.max(1)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_seconds.max(1))
    }

    pub fn apply_env_overrides(&mut self, profile: &str) {
        if let Some(v) = profiled_env_parse(profile, "SCHEDULER_TICK_INTERVAL_MS") {
            self.tick_interval_ms = v;
        }
        if let Some(v) = profiled_env_parse(profile, "SCHEDULER_MAX_CONCURRENT_TASKS") {
            self.max_concurrent_tasks = v;
        }
        if let Some(v) = profiled_env_parse(profile, "SCHEDULER_TASK_TIMEOUT_MS") {
            self.default_task_timeout_ms = v;
        }
        if let Some(v) = profiled_env_parse(profile, "SCHEDULER_FAILURE_THRESHOLD") {
            self.failure_threshold = v;
        }
        if let Some(v) = profiled_env_parse(profile, "SCHEDULER_HISTORY_CAPACITY") {
            self.history_capacity = v;
        }
        if let Some(v) = profiled_env_parse(profile, "SCHEDULER_SNAPSHOT_INTERVAL_SECONDS") {
            self.snapshot_interval_seconds = v;
        }
    }
}
