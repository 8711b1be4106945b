//! Task definitions and per-task runtime state.
//!
//! The registry is owned by the [`Scheduler`](crate::Scheduler). Reads are
//! public; every mutation goes through the scheduler (and, via it, the
//! atomic switch) so there is a single writer. The inner lock is a
//! `std::sync::RwLock` and is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use interlock_core::{AgentId, RingBuffer, TaskId};

use crate::error::RegistryError;
use crate::task::{TaskContext, TaskDefinition, TaskHandler};
use crate::types::{Priority, RunRecord, TaskStatus};

/// Mutable runtime state of one task.
#[derive(Debug, Clone)]
struct TaskState {
    status: TaskStatus,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: DateTime<Utc>,
    consecutive_failures: u32,
    /// Bumped on every admission and on timeout abandonment.
    generation: u64,
    /// Cleared by `deregister`; inactive tasks are never admitted.
    active: bool,
    history: RingBuffer<RunRecord>,
}

struct TaskEntry {
    seq: u64,
    def: TaskDefinition,
    state: TaskState,
}

impl TaskEntry {
    fn view(&self) -> TaskView {
        TaskView {
            id: self.def.id.clone(),
            name: self.def.name.clone(),
            agent_id: self.def.agent_id.clone(),
            priority: self.def.priority,
            interval: self.def.interval,
            registration_seq: self.seq,
            status: self.state.status,
            last_run_at: self.state.last_run_at,
            next_run_at: self.state.next_run_at,
            consecutive_failures: self.state.consecutive_failures,
            generation: self.state.generation,
            active: self.state.active,
        }
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.active && self.state.status == TaskStatus::Idle && self.state.next_run_at <= now
    }
}

/// Read-only copy of a task's definition and state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub name: String,
    pub agent_id: AgentId,
    pub priority: Priority,
    pub interval: Duration,
    pub registration_seq: u64,
    pub status: TaskStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub generation: u64,
    pub active: bool,
}

/// What the atomic switch records before pausing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub status: TaskStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
}

/// Timing and failure state persisted across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTaskState {
    pub id: TaskId,
    pub status: TaskStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub consecutive_failures: u32,
}

/// A task admitted for one invocation.
#[derive(Clone)]
pub struct Invocation {
    pub task_id: TaskId,
    pub name: String,
    pub agent_id: AgentId,
    pub generation: u64,
    pub timeout: Option<Duration>,
    pub consecutive_failures: u32,
    pub handler: Arc<dyn TaskHandler>,
}

impl Invocation {
    pub fn context(&self, started_at: DateTime<Utc>) -> TaskContext {
        TaskContext {
            task_id: self.task_id.clone(),
            name: self.name.clone(),
            agent_id: self.agent_id.clone(),
            generation: self.generation,
            started_at,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// How a finished invocation was applied to task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunApplied {
    /// Applied; the task is now in the given status.
    Applied(TaskStatus),
    /// A newer generation superseded this invocation; the result was discarded.
    Stale,
}

#[derive(Default)]
struct RegistryInner {
    tasks: HashMap<TaskId, TaskEntry>,
    next_seq: u64,
}

/// Holds every registered task. Tasks are never removed while the process runs.
pub struct TaskRegistry {
    inner: RwLock<RegistryInner>,
    history_capacity: usize,
}

impl TaskRegistry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            history_capacity,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<TaskView> {
        self.read().tasks.get(id).map(TaskEntry::view)
    }

    /// Active tasks in registration order.
    pub fn list_active(&self) -> Vec<TaskView> {
        let inner = self.read();
        let mut views: Vec<TaskView> = inner
            .tasks
            .values()
            .filter(|e| e.state.active)
            .map(TaskEntry::view)
            .collect();
        views.sort_by_key(|v| v.registration_seq);
        views
    }

    /// Every task, including deregistered ones, in registration order.
    pub fn list_all(&self) -> Vec<TaskView> {
        let inner = self.read();
        let mut views: Vec<TaskView> = inner.tasks.values().map(TaskEntry::view).collect();
        views.sort_by_key(|v| v.registration_seq);
        views
    }

    /// Run history of a task, oldest first.
    pub fn history(&self, id: &str) -> Option<Vec<RunRecord>> {
        self.read().tasks.get(id).map(|e| e.state.history.to_vec())
    }

    pub fn len(&self) -> usize {
        self.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().tasks.is_empty()
    }

    /// Ids of due tasks in admission order: priority, then registration order.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let inner = self.read();
        let mut due: Vec<(Priority, u64, &TaskId)> = inner
            .tasks
            .values()
            .filter(|e| e.is_due(now))
            .map(|e| (e.def.priority, e.seq, &e.def.id))
            .collect();
        due.sort_by_key(|(priority, seq, _)| (*priority, *seq));
        due.into_iter().map(|(_, _, id)| id.clone()).collect()
    }

    /// Running tasks plus idle tasks due within `window`. Does not mutate.
    pub fn snapshot_imminent(&self, now: DateTime<Utc>, window: Duration) -> Vec<TaskSnapshot> {
        let horizon = now + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let inner = self.read();
        let mut snaps: Vec<(u64, TaskSnapshot)> = inner
            .tasks
            .values()
            .filter(|e| e.state.active)
            .filter(|e| match e.state.status {
                TaskStatus::Running => true,
                TaskStatus::Idle => e.state.next_run_at <= horizon,
                TaskStatus::Paused | TaskStatus::Failed => false,
            })
            .map(|e| {
                (
                    e.seq,
                    TaskSnapshot {
                        id: e.def.id.clone(),
                        status: e.state.status,
                        last_run_at: e.state.last_run_at,
                        next_run_at: e.state.next_run_at,
                    },
                )
            })
            .collect();
        snaps.sort_by_key(|(seq, _)| *seq);
        snaps.into_iter().map(|(_, s)| s).collect()
    }

    pub fn persisted_states(&self) -> Vec<PersistedTaskState> {
        let inner = self.read();
        let mut states: Vec<(u64, PersistedTaskState)> = inner
            .tasks
            .values()
            .map(|e| {
                (
                    e.seq,
                    PersistedTaskState {
                        id: e.def.id.clone(),
                        status: e.state.status,
                        last_run_at: e.state.last_run_at,
                        next_run_at: e.state.next_run_at,
                        consecutive_failures: e.state.consecutive_failures,
                    },
                )
            })
            .collect();
        states.sort_by_key(|(seq, _)| *seq);
        states.into_iter().map(|(_, s)| s).collect()
    }

    // ── Registration ────────────────────────────────────────────────

    pub(crate) fn register(
        &self,
        def: TaskDefinition,
        now: DateTime<Utc>,
    ) -> Result<TaskId, RegistryError> {
        if def.id.trim().is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if def.interval.is_zero() {
            return Err(RegistryError::InvalidInterval(def.id));
        }

        let mut inner = self.write();
        if inner.tasks.contains_key(&def.id) {
            return Err(RegistryError::DuplicateId(def.id));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let next_run_at =
            now + chrono::Duration::from_std(def.initial_delay).unwrap_or(chrono::Duration::zero());
        let id = def.id.clone();
        info!(
            task_id = %id,
            agent_id = %def.agent_id,
            priority = ?def.priority,
            interval_ms = def.interval.as_millis() as u64,
            "Registered task"
        );
        inner.tasks.insert(
            id.clone(),
            TaskEntry {
                seq,
                def,
                state: TaskState {
                    status: TaskStatus::Idle,
                    last_run_at: None,
                    next_run_at,
                    consecutive_failures: 0,
                    generation: 0,
                    active: true,
                    history: RingBuffer::new(self.history_capacity),
                },
            },
        );
        Ok(id)
    }

    /// Soft-deactivate: the task stays visible but is never admitted again.
    pub(crate) fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let entry = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry.state.active = false;
        info!(task_id = %id, "Deregistered task");
        Ok(())
    }

    /// Failed → Idle, failures cleared, due at `now`.
    pub(crate) fn reset(&self, id: &str, now: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let entry = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if entry.state.status != TaskStatus::Failed {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: entry.state.status,
                to: TaskStatus::Idle,
            });
        }
        entry.state.status = TaskStatus::Idle;
        entry.state.consecutive_failures = 0;
        entry.state.next_run_at = now;
        info!(task_id = %id, "Reset failed task");
        Ok(())
    }

    // ── Pause / resume ──────────────────────────────────────────────

    /// Defer admission. Timestamps are left untouched.
    pub(crate) fn pause(&self, id: &str) -> Result<TaskStatus, RegistryError> {
        let mut inner = self.write();
        let entry = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let from = entry.state.status;
        match from {
            TaskStatus::Idle | TaskStatus::Running => {
                entry.state.status = TaskStatus::Paused;
                debug!(task_id = %id, from = ?from, "Paused task");
                Ok(from)
            }
            TaskStatus::Paused => Ok(from),
            TaskStatus::Failed => Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from,
                to: TaskStatus::Paused,
            }),
        }
    }

    /// Paused → Idle, keeping `last_run_at`/`next_run_at` exactly as they were.
    pub(crate) fn resume(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let entry = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        match entry.state.status {
            TaskStatus::Paused => {
                entry.state.status = TaskStatus::Idle;
                debug!(task_id = %id, "Resumed task");
                Ok(())
            }
            TaskStatus::Idle => Ok(()),
            from => Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from,
                to: TaskStatus::Idle,
            }),
        }
    }

    /// Paused → Idle with `next_run_at = now` for each id. Returns how many moved.
    pub(crate) fn resume_now(&self, ids: &[TaskId], now: DateTime<Utc>) -> usize {
        let mut inner = self.write();
        let mut resumed = 0;
        for id in ids {
            if let Some(entry) = inner.tasks.get_mut(id) {
                if entry.state.status == TaskStatus::Paused {
                    entry.state.status = TaskStatus::Idle;
                    entry.state.next_run_at = now;
                    resumed += 1;
                }
            }
        }
        resumed
    }

    /// Every Paused task → Idle, due at `now + delay`. Returns how many moved.
    pub(crate) fn resume_all_paused(&self, now: DateTime<Utc>, delay: Duration) -> usize {
        let due = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let mut inner = self.write();
        let mut resumed = 0;
        for entry in inner.tasks.values_mut() {
            if entry.state.status == TaskStatus::Paused {
                entry.state.status = TaskStatus::Idle;
                entry.state.next_run_at = due;
                resumed += 1;
            }
        }
        resumed
    }

    // ── Invocation lifecycle ────────────────────────────────────────

    /// Idle + due → Running with a fresh generation. `None` if the task is no
    /// longer admissible.
    pub(crate) fn begin_run(&self, id: &str, now: DateTime<Utc>) -> Option<Invocation> {
        let mut inner = self.write();
        let entry = inner.tasks.get_mut(id)?;
        if !entry.is_due(now) {
            return None;
        }
        entry.state.status = TaskStatus::Running;
        entry.state.generation += 1;
        Some(Invocation {
            task_id: entry.def.id.clone(),
            name: entry.def.name.clone(),
            agent_id: entry.def.agent_id.clone(),
            generation: entry.state.generation,
            timeout: entry.def.timeout,
            consecutive_failures: entry.state.consecutive_failures,
            handler: Arc::clone(&entry.def.handler),
        })
    }

    /// Apply a finished invocation if `generation` is still current.
    ///
    /// - Running: timestamps advance to `finished + interval`, status Idle
    ///   (or Failed once `failure_threshold` consecutive failures are reached).
    /// - Idle (force-resumed while in flight): `next_run_at` is kept.
    /// - Paused: history and the failure counter change, timestamps do not.
    ///   Reaching the threshold still moves the task to Failed.
    pub(crate) fn complete_run(
        &self,
        id: &str,
        generation: u64,
        record: RunRecord,
        failure_threshold: u32,
    ) -> RunApplied {
        let mut inner = self.write();
        Self::apply_result(&mut inner, id, generation, record, failure_threshold)
    }

    /// Record a timed-out invocation and bump the generation so its late
    /// result is discarded. Both happen under one write guard.
    pub(crate) fn abandon_run(
        &self,
        id: &str,
        generation: u64,
        record: RunRecord,
        failure_threshold: u32,
    ) -> RunApplied {
        let mut inner = self.write();
        let applied = Self::apply_result(&mut inner, id, generation, record, failure_threshold);
        if applied != RunApplied::Stale {
            if let Some(entry) = inner.tasks.get_mut(id) {
                entry.state.generation += 1;
            }
        }
        applied
    }

    fn apply_result(
        inner: &mut RegistryInner,
        id: &str,
        generation: u64,
        record: RunRecord,
        failure_threshold: u32,
    ) -> RunApplied {
        let Some(entry) = inner.tasks.get_mut(id) else {
            return RunApplied::Stale;
        };
        if entry.state.generation != generation {
            debug!(
                task_id = %id,
                generation,
                current = entry.state.generation,
                "Discarding stale result"
            );
            return RunApplied::Stale;
        }

        let failed = record.kind.is_failure();
        let finished_at = record.finished_at;
        entry.state.history.push(record);
        if failed {
            entry.state.consecutive_failures += 1;
        } else {
            entry.state.consecutive_failures = 0;
        }
        let exhausted = failed && entry.state.consecutive_failures >= failure_threshold;

        match entry.state.status {
            TaskStatus::Running | TaskStatus::Idle => {
                if entry.state.status == TaskStatus::Running {
                    entry.state.next_run_at = finished_at
                        + chrono::Duration::from_std(entry.def.interval)
                            .unwrap_or(chrono::Duration::zero());
                }
                entry.state.last_run_at = Some(finished_at);
                entry.state.status = if exhausted { TaskStatus::Failed } else { TaskStatus::Idle };
            }
            // Timing stays frozen while paused, but the failure still counts.
            TaskStatus::Paused if exhausted => entry.state.status = TaskStatus::Failed,
            TaskStatus::Paused | TaskStatus::Failed => {}
        }
        if exhausted && entry.state.status == TaskStatus::Failed {
            warn!(
                task_id = %id,
                failures = entry.state.consecutive_failures,
                "Task failed too many times, excluded until reset"
            );
        }
        RunApplied::Applied(entry.state.status)
    }

    /// Apply persisted timing to tasks with matching ids. Running and Paused
    /// come back as Idle. Returns how many tasks were updated.
    pub(crate) fn apply_persisted(&self, states: &[PersistedTaskState]) -> usize {
        let mut inner = self.write();
        let mut applied = 0;
        for persisted in states {
            let Some(entry) = inner.tasks.get_mut(&persisted.id) else {
                debug!(task_id = %persisted.id, "Ignoring persisted state for unknown task");
                continue;
            };
            entry.state.status = match persisted.status {
                TaskStatus::Failed => TaskStatus::Failed,
                _ => TaskStatus::Idle,
            };
            entry.state.last_run_at = persisted.last_run_at;
            entry.state.next_run_at = persisted.next_run_at;
            entry.state.consecutive_failures = persisted.consecutive_failures;
            applied += 1;
        }
        applied
    }
}
