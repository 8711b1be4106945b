use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signal::Signal;
use crate::stage::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityState {
    Spotted,
    Validated,
    Filtered,
    Executed,
    Rejected,
}

impl OpportunityState {
    /// State recorded when `stage` accepts the opportunity.
    pub fn after(stage: Stage) -> Self {
        match stage {
            Stage::Spot => OpportunityState::Spotted,
            Stage::Validate => OpportunityState::Validated,
            Stage::Filter => OpportunityState::Filtered,
            Stage::Execute => OpportunityState::Executed,
        }
    }
}

/// One stage decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAnnotation {
    pub state: OpportunityState,
    pub stage: Stage,
    /// For Executed, whether execution succeeded.
    pub valid: bool,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// A candidate raised by a signal and its append-only decision trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    id: Uuid,
    routing_key: String,
    signal: Signal,
    annotations: Vec<StageAnnotation>,
    created_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn new(signal: Signal) -> Self {
        Self {
            id: Uuid::new_v4(),
            routing_key: signal.routing_key().to_string(),
            signal,
            annotations: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn annotations(&self) -> &[StageAnnotation] {
        &self.annotations
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Latest state, `None` before any stage has run.
    pub fn state(&self) -> Option<OpportunityState> {
        self.annotations.last().map(|a| a.state)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            Some(OpportunityState::Executed | OpportunityState::Rejected)
        )
    }

    /// Stage that rejected the opportunity, if any.
    pub fn rejected_at(&self) -> Option<Stage> {
        self.annotations
            .last()
            .filter(|a| a.state == OpportunityState::Rejected)
            .map(|a| a.stage)
    }

    /// Whether the Execute stage ran and reported success.
    pub fn executed_successfully(&self) -> bool {
        self.annotations
            .last()
            .is_some_and(|a| a.state == OpportunityState::Executed && a.valid)
    }

    /// Append a decision. Ignored once the opportunity is terminal.
    pub(crate) fn annotate(&mut self, annotation: StageAnnotation) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.annotations.push(annotation);
        true
    }
}
