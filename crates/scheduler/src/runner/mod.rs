//! Scheduler runner: admission, execution, and the control surface used by
//! the atomic switch.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructor, registration, and accessors
//! - `scheduling`: per-tick due-task selection under the concurrency cap
//! - `execution`: the tick loop, drain, and single-invocation `TaskRunner`
//! - `control`: snapshot / pause / resume operations for interrupts
//! - `persistence`: task-state snapshots to a durable store

mod control;
mod core;
mod execution;
mod persistence;
mod scheduling;

pub use self::core::Scheduler;
pub use self::execution::{RunReport, TaskRunner};
pub use self::persistence::TASK_STATE_KEY;
pub use self::scheduling::TickReport;
pub use crate::registry::RunApplied;
