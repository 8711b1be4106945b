//! Staged evaluation of opportunities raised by external signals.
//!
//! An [`OpportunityPipeline`] walks Spot → Validate → Filter → Execute,
//! delegating each stage to the [`StageHandler`] the [`StageRouter`] selects
//! for the signal's routing key. Every decision is appended to the
//! [`Opportunity`] as a [`StageAnnotation`].

pub mod config;
pub mod error;
pub mod opportunity;
pub mod pipeline;
pub mod router;
pub mod signal;
pub mod stage;

pub use config::PipelineConfig;
pub use error::{PipelineError, StageError};
pub use opportunity::{Opportunity, OpportunityState, StageAnnotation};
pub use pipeline::{OpportunityPipeline, PipelineMetrics};
pub use router::StageRouter;
pub use signal::Signal;
pub use stage::{stage_fn, Stage, StageHandler, StageInput, StageOutput};
