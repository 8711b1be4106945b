use thiserror::Error;

use crate::types::TaskStatus;

/// Registry errors. `DuplicateId` is the one condition reported straight back
/// to the caller instead of being isolated and logged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task id already registered: {0}")]
    DuplicateId(String),

    #[error("task id must not be empty")]
    EmptyId,

    #[error("task {0} must have a positive interval")]
    InvalidInterval(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {id} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}
