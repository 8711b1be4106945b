use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use interlock_core::TaskId;

use crate::types::RunKind;

/// Scheduler operational metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Completed invocations by task id (successes and failures).
    pub tasks_executed: HashMap<TaskId, u64>,
    /// Failed, timed-out, or panicked invocations by task id.
    pub tasks_failed: HashMap<TaskId, u64>,
    /// Average invocation duration by task id.
    pub avg_task_duration: HashMap<TaskId, Duration>,
    /// Last completion time by task id.
    pub last_run: HashMap<TaskId, DateTime<Utc>>,
    pub timeouts: u64,
    pub panics: u64,
    /// Late results from abandoned invocations that were dropped.
    pub stale_results_discarded: u64,
    pub discoveries_published: u64,
    pub ticks: u64,
    pub admitted_total: u64,
    /// Due tasks left waiting for a slot on the most recent tick.
    pub deferred_last_tick: usize,
    /// Busy slots / total slots, sampled each tick (0.0 - 1.0).
    pub slot_utilization: f64,
}

impl SchedulerMetrics {
    /// Record a finished invocation.
    pub fn record_execution(&mut self, task_id: &str, duration: Duration, kind: RunKind) {
        *self.tasks_executed.entry(task_id.to_string()).or_default() += 1;
        self.last_run.insert(task_id.to_string(), Utc::now());
        if kind.is_failure() {
            *self.tasks_failed.entry(task_id.to_string()).or_default() += 1;
        }
        match kind {
            RunKind::TimedOut => self.timeouts += 1,
            RunKind::Panicked => self.panics += 1,
            _ => {}
        }

        let count = self.tasks_executed[task_id];
        let prev_avg = self
            .avg_task_duration
            .get(task_id)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration.insert(task_id.to_string(), new_avg);
    }

    pub fn record_tick(&mut self, admitted: usize, deferred: usize, busy: usize, slots: usize) {
        self.ticks += 1;
        self.admitted_total += admitted as u64;
        self.deferred_last_tick = deferred;
        self.slot_utilization = if slots == 0 { 0.0 } else { busy as f64 / slots as f64 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("scan", Duration::from_millis(100), RunKind::Success);

        assert_eq!(m.tasks_executed["scan"], 1);
        assert!(m.last_run.contains_key("scan"));
        assert!(!m.tasks_failed.contains_key("scan"));
        assert_eq!(m.avg_task_duration["scan"], Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("scan", Duration::from_millis(100), RunKind::Success);
        m.record_execution("scan", Duration::from_millis(200), RunKind::Failure);

        assert_eq!(m.tasks_executed["scan"], 2);
        assert_eq!(m.tasks_failed["scan"], 1);
        let avg = m.avg_task_duration["scan"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn failure_kinds_are_tallied() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("a", Duration::from_millis(5), RunKind::TimedOut);
        m.record_execution("a", Duration::from_millis(5), RunKind::Panicked);
        assert_eq!(m.timeouts, 1);
        assert_eq!(m.panics, 1);
        assert_eq!(m.tasks_failed["a"], 2);
    }

    #[test]
    fn tick_utilization() {
        let mut m = SchedulerMetrics::default();
        m.record_tick(2, 1, 2, 4);
        assert_eq!(m.ticks, 1);
        assert_eq!(m.admitted_total, 2);
        assert_eq!(m.deferred_last_tick, 1);
        assert_eq!(m.slot_utilization, 0.5);
    }
}
