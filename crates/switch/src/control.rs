use std::sync::Arc;
use std::time::Duration;

use interlock_core::TaskId;
use interlock_scheduler::{Scheduler, TaskSnapshot};

use crate::error::SwitchError;

/// The scheduling operations the atomic switch needs.
///
/// Implemented by [`Scheduler`]; tests substitute faulty implementations to
/// exercise emergency resume.
pub trait SchedulingControl: Send + Sync {
    /// Running tasks plus Idle tasks due within `window`. Must not mutate.
    fn snapshot_imminent(&self, window: Duration) -> Vec<TaskSnapshot>;

    /// Pause the listed tasks, returning those actually paused.
    fn pause_tasks(&self, ids: &[TaskId]) -> Result<Vec<TaskId>, SwitchError>;

    /// Listed tasks still Paused become Idle, due now.
    fn resume_tasks_now(&self, ids: &[TaskId]) -> Result<usize, SwitchError>;

    /// Every Paused task becomes Idle, due after `delay`.
    fn emergency_resume(&self, delay: Duration) -> usize;
}

impl SchedulingControl for Scheduler {
    fn snapshot_imminent(&self, window: Duration) -> Vec<TaskSnapshot> {
        Scheduler::snapshot_imminent(self, window)
    }

    fn pause_tasks(&self, ids: &[TaskId]) -> Result<Vec<TaskId>, SwitchError> {
        Ok(Scheduler::pause_tasks(self, ids))
    }

    fn resume_tasks_now(&self, ids: &[TaskId]) -> Result<usize, SwitchError> {
        Ok(Scheduler::resume_tasks_now(self, ids))
    }

    fn emergency_resume(&self, delay: Duration) -> usize {
        Scheduler::emergency_resume(self, delay)
    }
}

impl<T: SchedulingControl + ?Sized> SchedulingControl for Arc<T> {
    fn snapshot_imminent(&self, window: Duration) -> Vec<TaskSnapshot> {
        (**self).snapshot_imminent(window)
    }

    fn pause_tasks(&self, ids: &[TaskId]) -> Result<Vec<TaskId>, SwitchError> {
        (**self).pause_tasks(ids)
    }

    fn resume_tasks_now(&self, ids: &[TaskId]) -> Result<usize, SwitchError> {
        (**self).resume_tasks_now(ids)
    }

    fn emergency_resume(&self, delay: Duration) -> usize {
        (**self).emergency_resume(delay)
    }
}
