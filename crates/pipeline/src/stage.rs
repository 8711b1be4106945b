use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StageError;

/// One step of the opportunity pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Spot,
    Validate,
    Filter,
    Execute,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Spot, Stage::Validate, Stage::Filter, Stage::Execute];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Spot => "spot",
            Stage::Validate => "validate",
            Stage::Filter => "filter",
            Stage::Execute => "execute",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage handler is given.
#[derive(Debug, Clone, Serialize)]
pub struct StageInput {
    pub opportunity_id: Uuid,
    pub stage: Stage,
    pub routing_key: String,
    /// The signal payload for Spot, otherwise the previous stage's output.
    pub payload: serde_json::Value,
    /// 1.0 for Spot.
    pub prior_confidence: f64,
    pub prior_valid: bool,
}

/// A stage verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub valid: bool,
    pub confidence: f64,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Why the stage declined; used as the rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StageOutput {
    pub fn accept(confidence: f64, payload: serde_json::Value) -> Self {
        Self {
            valid: true,
            confidence,
            payload,
            reason: None,
        }
    }

    pub fn reject(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            confidence,
            payload: serde_json::Value::Null,
            reason: Some(reason.into()),
        }
    }
}

/// Collaborator that evaluates one stage for some routing keys.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn evaluate(&self, input: StageInput) -> Result<StageOutput, StageError>;
}

#[async_trait]
impl<T: StageHandler + ?Sized> StageHandler for Arc<T> {
    async fn evaluate(&self, input: StageInput) -> Result<StageOutput, StageError> {
        (**self).evaluate(input).await
    }
}

struct FnStage<F>(F);

#[async_trait]
impl<F, Fut> StageHandler for FnStage<F>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send + 'static,
{
    async fn evaluate(&self, input: StageInput) -> Result<StageOutput, StageError> {
        (self.0)(input).await
    }
}

/// Wrap an async closure as a [`StageHandler`].
pub fn stage_fn<F, Fut>(f: F) -> Arc<dyn StageHandler>
where
    F: Fn(StageInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send + 'static,
{
    Arc::new(FnStage(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_run_in_declared_order() {
        let mut shuffled = vec![Stage::Execute, Stage::Spot, Stage::Filter, Stage::Validate];
        shuffled.sort();
        assert_eq!(shuffled, Stage::ALL.to_vec());
        assert_eq!(Stage::Filter.to_string(), "filter");
    }

    #[test]
    fn output_constructors() {
        let ok = StageOutput::accept(0.97, serde_json::json!({"edge": 3}));
        assert!(ok.valid);
        assert!(ok.reason.is_none());

        let no = StageOutput::reject(0.1, "stale quote");
        assert!(!no.valid);
        assert_eq!(no.reason.as_deref(), Some("stale quote"));
    }
}
