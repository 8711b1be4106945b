use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::stage::{Stage, StageHandler};

/// Chooses the handler for a `(stage, routing_key)` pair.
///
/// A handler registered for the exact key wins; otherwise the stage's
/// default is used.
#[derive(Default, Clone)]
pub struct StageRouter {
    routes: HashMap<(Stage, String), Arc<dyn StageHandler>>,
    defaults: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl StageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `stage` for `routing_key` with `handler`, replacing any earlier route.
    pub fn route(
        mut self,
        stage: Stage,
        routing_key: impl Into<String>,
        handler: Arc<dyn StageHandler>,
    ) -> Self {
        let routing_key = routing_key.into();
        debug!(stage = %stage, routing_key = %routing_key, "registered stage route");
        self.routes.insert((stage, routing_key), handler);
        self
    }

    /// Handle `stage` for every routing key without a specific route.
    pub fn default_route(mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> Self {
        self.defaults.insert(stage, handler);
        self
    }

    pub fn resolve(&self, stage: Stage, routing_key: &str) -> Option<Arc<dyn StageHandler>> {
        self.routes
            .get(&(stage, routing_key.to_string()))
            .or_else(|| self.defaults.get(&stage))
            .cloned()
    }

    /// Stages with no default handler. Signals whose key has no specific
    /// route for these stages fail with `NoRoute`.
    pub fn stages_without_default(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| !self.defaults.contains_key(s))
            .collect()
    }
}
