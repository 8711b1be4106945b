use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use interlock_core::{AgentId, TaskId};

/// A notable result surfaced by a task run.
///
/// Fields are private: once built, a discovery is only ever read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    id: Uuid,
    kind: String,
    payload: serde_json::Value,
    /// Clamped to `[0, 1]`.
    confidence: f64,
    source_task: TaskId,
    source_agent: AgentId,
    created_at: DateTime<Utc>,
}

impl Discovery {
    pub fn new(
        kind: impl Into<String>,
        payload: serde_json::Value,
        confidence: f64,
        source_task: impl Into<TaskId>,
        source_agent: impl Into<AgentId>,
    ) -> Self {
        let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            confidence,
            source_task: source_task.into(),
            source_agent: source_agent.into(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Type tag used by subscribers to route the discovery.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn source_task(&self) -> &str {
        &self.source_task
    }

    pub fn source_agent(&self) -> &str {
        &self.source_agent
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
