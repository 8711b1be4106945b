use thiserror::Error;

use crate::stage::Stage;

/// Error raised by a [`StageHandler`](crate::StageHandler).
///
/// A handler that merely disagrees with an opportunity returns
/// `StageOutput { valid: false, .. }` instead.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage evaluation failed: {0}")]
    Failed(String),

    #[error("stage collaborator unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no handler for stage {stage} and routing key '{routing_key}'")]
    NoRoute { stage: Stage, routing_key: String },

    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    #[error("stage {stage} timed out after {timeout_ms}ms")]
    StageTimeout { stage: Stage, timeout_ms: u64 },
}

impl PipelineError {
    /// The stage the pipeline stopped at.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::NoRoute { stage, .. }
            | PipelineError::Stage { stage, .. }
            | PipelineError::StageTimeout { stage, .. } => *stage,
        }
    }
}
