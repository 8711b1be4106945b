//! Priority scheduler for periodic agent tasks.
//!
//! Tasks are registered once with a priority and an interval. Every tick the
//! [`Scheduler`] admits due tasks (priority first, then registration order)
//! into a bounded number of concurrency slots; the [`TaskRunner`] executes each
//! handler under a timeout and applies its result through a generation guard.

pub mod error;
pub mod metrics;
pub mod registry;
pub mod runner;
pub mod task;
pub mod types;

pub use error::RegistryError;
pub use metrics::SchedulerMetrics;
pub use registry::{PersistedTaskState, TaskRegistry, TaskSnapshot, TaskView};
pub use runner::{RunApplied, RunReport, Scheduler, TaskRunner, TickReport, TASK_STATE_KEY};
pub use task::{handler_fn, TaskContext, TaskDefinition, TaskHandler, TaskOutcome};
pub use types::{Priority, RunKind, RunRecord, SchedulerConfig, TaskStatus};
