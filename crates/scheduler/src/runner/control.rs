use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use interlock_core::TaskId;

use crate::registry::TaskSnapshot;
use crate::types::TaskStatus;

use super::Scheduler;

// ── Interrupt control ───────────────────────────────────────────────
//
// Used by the atomic switch. None of these hold a lock across an await.

impl Scheduler {
    /// Running tasks plus Idle tasks due within `window`, in registration order.
    pub fn snapshot_imminent(&self, window: Duration) -> Vec<TaskSnapshot> {
        self.registry.snapshot_imminent(Utc::now(), window)
    }

    /// Pause each listed task. Returns the ids actually moved to Paused;
    /// tasks that were already Paused or Failed are skipped.
    pub fn pause_tasks(&self, ids: &[TaskId]) -> Vec<TaskId> {
        let mut paused = Vec::with_capacity(ids.len());
        for id in ids {
            match self.registry.pause(id) {
                Ok(TaskStatus::Paused) => {}
                Ok(_) => paused.push(id.clone()),
                Err(e) => warn!(task_id = %id, error = %e, "Could not pause task"),
            }
        }
        paused
    }

    /// Move each listed task that is still Paused to Idle, due now.
    pub fn resume_tasks_now(&self, ids: &[TaskId]) -> usize {
        self.registry.resume_now(ids, Utc::now())
    }

    /// Move every Paused task to Idle, due after `delay`.
    pub fn emergency_resume(&self, delay: Duration) -> usize {
        let resumed = self.registry.resume_all_paused(Utc::now(), delay);
        info!(
            resumed,
            delay_ms = delay.as_millis() as u64,
            "Emergency resume of paused tasks"
        );
        resumed
    }
}
