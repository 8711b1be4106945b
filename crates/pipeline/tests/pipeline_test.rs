//! Integration tests for routed multi-chain evaluation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use interlock_pipeline::{
    OpportunityPipeline, OpportunityState, PipelineConfig, Signal, Stage, StageError,
    StageHandler, StageInput, StageOutput, StageRouter,
};

/// Scores opportunities from a per-key table and records every call.
struct TableScorer {
    scores: HashMap<String, f64>,
    calls: Mutex<Vec<(Stage, String)>>,
}

impl TableScorer {
    fn new(scores: &[(&str, f64)]) -> Self {
        Self {
            scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StageHandler for TableScorer {
    async fn evaluate(&self, input: StageInput) -> Result<StageOutput, StageError> {
        self.calls
            .lock()
            .unwrap()
            .push((input.stage, input.routing_key.clone()));
        let score = self
            .scores
            .get(&input.routing_key)
            .copied()
            .ok_or_else(|| StageError::Unavailable(format!("no table for {}", input.routing_key)))?;
        Ok(StageOutput::accept(score, json!({"score": score})))
    }
}

struct Executor;

#[async_trait]
impl StageHandler for Executor {
    async fn evaluate(&self, input: StageInput) -> Result<StageOutput, StageError> {
        assert!(input.prior_valid);
        Ok(StageOutput::accept(1.0, json!({"submitted": input.routing_key})))
    }
}

fn pipeline(scorer: Arc<TableScorer>) -> OpportunityPipeline {
    let router = StageRouter::new()
        .default_route(Stage::Spot, scorer.clone())
        .default_route(Stage::Validate, scorer.clone())
        .default_route(Stage::Filter, scorer)
        .default_route(Stage::Execute, Arc::new(Executor));
    OpportunityPipeline::new(PipelineConfig::default(), router)
}

#[tokio::test]
async fn each_chain_is_scored_independently() {
    let scorer = Arc::new(TableScorer::new(&[("base", 0.97), ("arbitrum", 0.80)]));
    let pipeline = pipeline(scorer.clone());

    let base = pipeline
        .process(&Signal::new("dex-feed", 0.01, json!({})).with_routing_key("base"))
        .await
        .unwrap();
    let arb = pipeline
        .process(&Signal::new("dex-feed", 0.01, json!({})).with_routing_key("arbitrum"))
        .await
        .unwrap();

    assert!(base.executed_successfully());
    assert_eq!(base.annotations().last().unwrap().payload, json!({"submitted": "base"}));
    assert_eq!(arb.rejected_at(), Some(Stage::Filter));
    assert_eq!(arb.annotations().last().unwrap().state, OpportunityState::Rejected);

    let calls = scorer.calls.lock().unwrap();
    assert_eq!(calls.len(), 6);
    assert!(calls.iter().all(|(stage, _)| *stage != Stage::Execute));

    let metrics = pipeline.metrics();
    assert_eq!(metrics.processed, 2);
    assert_eq!(metrics.executed, 1);
    assert_eq!(metrics.below_floor, 1);
}

#[tokio::test]
async fn unknown_chain_aborts_at_spot() {
    let pipeline = pipeline(Arc::new(TableScorer::new(&[("base", 0.99)])));

    let err = pipeline
        .process(&Signal::new("dex-feed", 0.01, json!({})).with_routing_key("solana"))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Stage::Spot);
    assert!(err.to_string().contains("no table for solana"));
}
