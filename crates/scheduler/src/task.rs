use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use interlock_core::{AgentId, TaskId};

use crate::types::{Priority, RunKind};

/// What a task handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success {
        summary: Option<String>,
    },
    /// A success that surfaced something notable; published on the discovery bus.
    Discovery {
        kind: String,
        data: serde_json::Value,
        confidence: f64,
    },
    Failure {
        error: String,
    },
}

impl TaskOutcome {
    pub fn success() -> Self {
        TaskOutcome::Success { summary: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            error: error.into(),
        }
    }

    pub fn discovery(kind: impl Into<String>, data: serde_json::Value, confidence: f64) -> Self {
        TaskOutcome::Discovery {
            kind: kind.into(),
            data,
            confidence,
        }
    }

    pub fn kind(&self) -> RunKind {
        match self {
            TaskOutcome::Success { .. } => RunKind::Success,
            TaskOutcome::Discovery { .. } => RunKind::Discovery,
            TaskOutcome::Failure { .. } => RunKind::Failure,
        }
    }

    /// Text recorded in the run history.
    pub fn message(&self) -> Option<String> {
        match self {
            TaskOutcome::Success { summary } => summary.clone(),
            TaskOutcome::Discovery { kind, .. } => Some(kind.clone()),
            TaskOutcome::Failure { error } => Some(error.clone()),
        }
    }
}

/// Per-invocation information handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub name: String,
    pub agent_id: AgentId,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    /// Failures immediately preceding this invocation.
    pub consecutive_failures: u32,
}

/// The periodic unit of work behind a task.
///
/// Handlers may only suspend inside their own awaits; every invocation is
/// bounded by the runner's timeout. A panic is recorded as a failure.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Everything needed to register a task.
#[derive(Clone)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub name: String,
    pub agent_id: AgentId,
    pub priority: Priority,
    pub interval: Duration,
    /// Overrides the scheduler's default handler timeout.
    pub timeout: Option<Duration>,
    /// Delay before the first run. Zero means due at registration.
    pub initial_delay: Duration,
    pub handler: Arc<dyn TaskHandler>,
}

impl TaskDefinition {
    pub fn new(
        id: impl Into<TaskId>,
        agent_id: impl Into<AgentId>,
        priority: Priority,
        interval: Duration,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_id: agent_id.into(),
            priority,
            interval,
            timeout: None,
            initial_delay: Duration::ZERO,
            handler,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("agent_id", &self.agent_id)
            .field("priority", &self.priority)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("initial_delay", &self.initial_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_kinds_and_messages() {
        assert_eq!(TaskOutcome::success().kind(), RunKind::Success);
        assert_eq!(TaskOutcome::success().message(), None);

        let d = TaskOutcome::discovery("spread", json!({"bps": 12}), 0.7);
        assert_eq!(d.kind(), RunKind::Discovery);
        assert_eq!(d.message().as_deref(), Some("spread"));

        let f = TaskOutcome::failure("rpc timeout");
        assert_eq!(f.kind(), RunKind::Failure);
        assert_eq!(f.message().as_deref(), Some("rpc timeout"));
    }

    #[test]
    fn definition_builder() {
        let def = TaskDefinition::new(
            "price-scan",
            "scout",
            Priority::Medium,
            Duration::from_secs(5),
            handler_fn(|_| async { TaskOutcome::success() }),
        )
        .with_name("Price scan")
        .with_timeout(Duration::from_secs(2));

        assert_eq!(def.name, "Price scan");
        assert_eq!(def.timeout, Some(Duration::from_secs(2)));
        assert_eq!(def.initial_delay, Duration::ZERO);
        assert!(format!("{def:?}").contains("price-scan"));
    }

    #[tokio::test]
    async fn handler_fn_invokes_closure() {
        let handler = handler_fn(|ctx: TaskContext| async move {
            TaskOutcome::Success {
                summary: Some(format!("gen {}", ctx.generation)),
            }
        });
        let ctx = TaskContext {
            task_id: "t".into(),
            name: "t".into(),
            agent_id: "a".into(),
            generation: 7,
            started_at: Utc::now(),
            consecutive_failures: 0,
        };
        assert_eq!(
            handler.run(ctx).await,
            TaskOutcome::Success {
                summary: Some("gen 7".into())
            }
        );
    }
}
