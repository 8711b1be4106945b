use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use interlock_core::{DurableStore, StoreError};

use crate::registry::PersistedTaskState;

use super::Scheduler;

/// Store key of the task-state snapshot.
pub const TASK_STATE_KEY: &str = "scheduler/task-state";

impl Scheduler {
    /// Write every task's timing and failure state. Returns the task count.
    pub async fn persist_state(&self, store: &dyn DurableStore) -> Result<usize, StoreError> {
        let states = self.registry.persisted_states();
        let count = states.len();
        store
            .store(TASK_STATE_KEY, serde_json::to_value(&states)?)
            .await?;
        debug!(count, "Persisted task state");
        Ok(count)
    }

    /// Apply the last persisted snapshot to already-registered tasks with
    /// matching ids. Returns how many tasks were updated.
    pub async fn restore_state(&self, store: &dyn DurableStore) -> Result<usize, StoreError> {
        let Some(value) = store.load_latest(TASK_STATE_KEY).await? else {
            return Ok(0);
        };
        let states: Vec<PersistedTaskState> = serde_json::from_value(value)?;
        let applied = self.registry.apply_persisted(&states);
        info!(applied, stored = states.len(), "Restored task state");
        Ok(applied)
    }

    /// Persist on `interval` until shutdown, then once more.
    pub fn spawn_snapshot_loop(
        self: &Arc<Self>,
        store: Arc<dyn DurableStore>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            while !scheduler.is_shutdown() {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.persist_state(store.as_ref()).await {
                            warn!(error = %e, "Task-state snapshot failed, retrying next tick");
                        }
                    }
                    _ = scheduler.shutdown_notify.notified() => break,
                }
            }

            if let Err(e) = scheduler.persist_state(store.as_ref()).await {
                warn!(error = %e, "Final task-state snapshot failed");
            }
            info!("Task-state snapshot loop stopped");
        })
    }
}
