use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use interlock_core::TaskId;

use super::Scheduler;

/// Result of one admission pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Tasks started this tick, in admission order.
    pub admitted: Vec<TaskId>,
    /// Due tasks left queued because every slot was busy.
    pub deferred: Vec<TaskId>,
}

impl Scheduler {
    /// Admit due tasks as of now. Must be called inside a tokio runtime.
    pub fn tick(&self) -> TickReport {
        self.tick_at(Utc::now())
    }

    /// Admit tasks due at `now`, highest priority first, while slots are free.
    ///
    /// Once a slot cannot be acquired every remaining due task is deferred,
    /// so a lower-priority task never jumps a higher one within a tick.
    pub fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let due = self.registry.due_tasks(now);
        let mut report = TickReport::default();

        let mut slots_exhausted = false;
        for id in due {
            if slots_exhausted {
                report.deferred.push(id);
                continue;
            }
            let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    slots_exhausted = true;
                    report.deferred.push(id);
                    continue;
                }
            };
            // The task may have been paused or deregistered since `due_tasks`.
            let Some(invocation) = self.registry.begin_run(&id, now) else {
                trace!(task_id = %id, "Task no longer admissible");
                continue;
            };

            debug!(task_id = %id, generation = invocation.generation, "Admitting task");
            let runner = self.runner.clone();
            tokio::spawn(async move {
                runner.run(invocation, permit).await;
            });
            report.admitted.push(id);
        }

        let busy = self.slot_count.saturating_sub(self.slots.available_permits());
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_tick(report.admitted.len(), report.deferred.len(), busy, self.slot_count);

        if !report.deferred.is_empty() {
            debug!(
                admitted = report.admitted.len(),
                deferred = report.deferred.len(),
                "Slots exhausted, deferring remaining due tasks"
            );
        }
        report
    }
}
