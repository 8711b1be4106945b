use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::opportunity::{Opportunity, OpportunityState, StageAnnotation};
use crate::router::StageRouter;
use crate::signal::Signal;
use crate::stage::{Stage, StageInput, StageOutput};

/// Pipeline counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineMetrics {
    pub processed: u64,
    pub executed: u64,
    pub execution_failures: u64,
    /// Rejections by the stage that rejected.
    pub rejected: HashMap<Stage, u64>,
    /// Filter rejections caused by the confidence floor alone.
    pub below_floor: u64,
    pub errors: u64,
    pub avg_duration: Duration,
}

impl PipelineMetrics {
    fn record(&mut self, opportunity: Option<&Opportunity>, duration: Duration) {
        self.processed += 1;
        match opportunity {
            Some(opp) => {
                if let Some(stage) = opp.rejected_at() {
                    *self.rejected.entry(stage).or_default() += 1;
                } else if opp.executed_successfully() {
                    self.executed += 1;
                } else {
                    self.execution_failures += 1;
                }
            }
            None => self.errors += 1,
        }

        let n = self.processed as f64;
        let prev = self.avg_duration.as_nanos() as f64;
        let avg = prev + (duration.as_nanos() as f64 - prev) / n;
        self.avg_duration = Duration::from_nanos(avg as u64);
    }
}

/// Spot → Validate → Filter → Execute over routed stage handlers.
pub struct OpportunityPipeline {
    config: PipelineConfig,
    router: StageRouter,
    metrics: RwLock<PipelineMetrics>,
}

impl OpportunityPipeline {
    pub fn new(config: PipelineConfig, router: StageRouter) -> Self {
        let missing = router.stages_without_default();
        if !missing.is_empty() {
            debug!(?missing, "pipeline built without default handlers for some stages");
        }
        Self {
            config,
            router,
            metrics: RwLock::new(PipelineMetrics::default()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Evaluate one signal to a terminal opportunity.
    ///
    /// A rejection is a normal result. A missing route, a stage error, or a
    /// stage timeout aborts the run with a [`PipelineError`].
    #[instrument(skip_all, fields(source = %signal.source, routing_key = %signal.routing_key()))]
    pub async fn process(&self, signal: &Signal) -> Result<Opportunity, PipelineError> {
        let clock = Instant::now();
        let result = self.run_stages(signal).await;
        let elapsed = clock.elapsed();

        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record(result.as_ref().ok(), elapsed);

        let elapsed_ms = elapsed.as_millis() as u64;
        match &result {
            Ok(opp) => info!(
                opportunity_id = %opp.id(),
                state = ?opp.state(),
                rejected_at = ?opp.rejected_at(),
                elapsed_ms,
                "Opportunity evaluated"
            ),
            Err(e) => warn!(error = %e, stage = %e.stage(), elapsed_ms, "Opportunity pipeline aborted"),
        }
        result
    }

    async fn run_stages(&self, signal: &Signal) -> Result<Opportunity, PipelineError> {
        let mut opportunity = Opportunity::new(signal.clone());
        let routing_key = opportunity.routing_key().to_string();
        let mut payload = signal.payload.clone();
        let mut prior_confidence = 1.0;

        for stage in Stage::ALL {
            let handler = self.router.resolve(stage, &routing_key).ok_or_else(|| {
                PipelineError::NoRoute {
                    stage,
                    routing_key: routing_key.clone(),
                }
            })?;

            let input = StageInput {
                opportunity_id: opportunity.id(),
                stage,
                routing_key: routing_key.clone(),
                payload,
                prior_confidence,
                prior_valid: true,
            };
            let output = self.call_stage(stage, handler.evaluate(input)).await?;
            let confidence = clamp_confidence(output.confidence);
            debug!(stage = %stage, valid = output.valid, confidence, "Stage verdict");

            if stage == Stage::Execute {
                opportunity.annotate(annotation(
                    OpportunityState::Executed,
                    stage,
                    output.valid,
                    confidence,
                    output.reason,
                    output.payload,
                ));
                break;
            }

            if !output.valid {
                let reason = output
                    .reason
                    .unwrap_or_else(|| format!("{stage} stage reported invalid"));
                opportunity.annotate(annotation(
                    OpportunityState::Rejected,
                    stage,
                    false,
                    confidence,
                    Some(reason),
                    output.payload,
                ));
                break;
            }

            if stage == Stage::Filter && confidence < self.config.filter_confidence_floor {
                let reason = format!(
                    "confidence {confidence:.3} below floor {:.3}",
                    self.config.filter_confidence_floor
                );
                self.metrics
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .below_floor += 1;
                opportunity.annotate(annotation(
                    OpportunityState::Rejected,
                    stage,
                    false,
                    confidence,
                    Some(reason),
                    output.payload,
                ));
                break;
            }

            opportunity.annotate(annotation(
                OpportunityState::after(stage),
                stage,
                true,
                confidence,
                None,
                output.payload.clone(),
            ));
            payload = output.payload;
            prior_confidence = confidence;
        }

        Ok(opportunity)
    }

    async fn call_stage<F>(&self, stage: Stage, call: F) -> Result<StageOutput, PipelineError>
    where
        F: std::future::Future<Output = Result<StageOutput, crate::error::StageError>>,
    {
        let limit = self.config.stage_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(PipelineError::Stage { stage, source }),
            Err(_) => Err(PipelineError::StageTimeout {
                stage,
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }
}

fn annotation(
    state: OpportunityState,
    stage: Stage,
    valid: bool,
    confidence: f64,
    reason: Option<String>,
    payload: serde_json::Value,
) -> StageAnnotation {
    StageAnnotation {
        state,
        stage,
        valid,
        confidence,
        reason,
        payload,
        at: Utc::now(),
    }
}

fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::error::StageError;
    use crate::stage::{stage_fn, StageHandler};

    fn fixed(confidence: f64) -> Arc<dyn StageHandler> {
        stage_fn(move |input: StageInput| async move {
            Ok(StageOutput::accept(confidence, input.payload))
        })
    }

    fn counting(calls: Arc<AtomicUsize>, valid: bool) -> Arc<dyn StageHandler> {
        stage_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(StageOutput {
                    valid,
                    confidence: 0.99,
                    payload: json!({"tx": "0xabc"}),
                    reason: None,
                })
            }
        })
    }

    fn router(spot: f64, validate: f64, filter: f64, execute: Arc<dyn StageHandler>) -> StageRouter {
        StageRouter::new()
            .default_route(Stage::Spot, fixed(spot))
            .default_route(Stage::Validate, fixed(validate))
            .default_route(Stage::Filter, fixed(filter))
            .default_route(Stage::Execute, execute)
    }

    fn signal() -> Signal {
        Signal::new("mempool", 0.006, json!({"pool": "eth-usdc"}))
    }

    #[tokio::test]
    async fn filter_floor_rejects_before_execute() {
        let executed = Arc::new(AtomicUsize::new(0));
        let pipeline = OpportunityPipeline::new(
            PipelineConfig::default(),
            router(0.90, 0.92, 0.80, counting(executed.clone(), true)),
        );

        let opp = pipeline.process(&signal()).await.unwrap();

        assert_eq!(opp.rejected_at(), Some(Stage::Filter));
        let states: Vec<_> = opp.annotations().iter().map(|a| a.state).collect();
        assert_eq!(
            states,
            vec![OpportunityState::Spotted, OpportunityState::Validated, OpportunityState::Rejected]
        );
        assert!(opp.annotations()[2].reason.as_deref().unwrap().contains("below floor"));
        assert_eq!(executed.load(Ordering::SeqCst), 0);

        let m = pipeline.metrics();
        assert_eq!(m.below_floor, 1);
        assert_eq!(m.rejected[&Stage::Filter], 1);
    }

    #[tokio::test]
    async fn confident_opportunity_executes() {
        let executed = Arc::new(AtomicUsize::new(0));
        let pipeline = OpportunityPipeline::new(
            PipelineConfig::default(),
            router(0.97, 0.96, 0.95, counting(executed.clone(), true)),
        );

        let opp = pipeline.process(&signal()).await.unwrap();

        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(opp.state(), Some(OpportunityState::Executed));
        assert!(opp.executed_successfully());
        assert_eq!(opp.annotations().len(), 4);
        assert_eq!(pipeline.metrics().executed, 1);
    }

    #[tokio::test]
    async fn failed_execution_is_terminal() {
        let executed = Arc::new(AtomicUsize::new(0));
        let pipeline = OpportunityPipeline::new(
            PipelineConfig::default(),
            router(0.99, 0.99, 0.99, counting(executed.clone(), false)),
        );

        let opp = pipeline.process(&signal()).await.unwrap();

        assert_eq!(opp.state(), Some(OpportunityState::Executed));
        assert!(opp.is_terminal());
        assert!(!opp.executed_successfully());
        assert_eq!(opp.rejected_at(), None);
        assert_eq!(pipeline.metrics().execution_failures, 1);
    }

    #[tokio::test]
    async fn invalid_stage_short_circuits() {
        let later = Arc::new(AtomicUsize::new(0));
        let router = StageRouter::new()
            .default_route(Stage::Spot, fixed(0.99))
            .default_route(
                Stage::Validate,
                stage_fn(|_| async { Ok(StageOutput::reject(0.99, "pool drained")) }),
            )
            .default_route(Stage::Filter, counting(later.clone(), true))
            .default_route(Stage::Execute, counting(later.clone(), true));
        let pipeline = OpportunityPipeline::new(PipelineConfig::default(), router);

        let opp = pipeline.process(&signal()).await.unwrap();

        assert_eq!(opp.rejected_at(), Some(Stage::Validate));
        assert_eq!(opp.annotations().last().unwrap().reason.as_deref(), Some("pool drained"));
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stage_receives_prior_output() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = seen.clone();
            stage_fn(move |input: StageInput| {
                seen.lock().unwrap().push((input.stage, input.prior_confidence, input.payload.clone()));
                async move { Ok(StageOutput::accept(0.99, json!({"from": input.stage.as_str()}))) }
            })
        };
        let router = StageRouter::new()
            .default_route(Stage::Spot, recorder.clone())
            .default_route(Stage::Validate, recorder.clone())
            .default_route(Stage::Filter, recorder.clone())
            .default_route(Stage::Execute, recorder);
        let pipeline = OpportunityPipeline::new(PipelineConfig::default(), router);

        pipeline.process(&signal()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], (Stage::Spot, 1.0, json!({"pool": "eth-usdc"})));
        assert_eq!(seen[1], (Stage::Validate, 0.99, json!({"from": "spot"})));
        assert_eq!(seen[3].2, json!({"from": "filter"}));
    }

    #[tokio::test]
    async fn routing_key_selects_handler() {
        let specific = Arc::new(AtomicUsize::new(0));
        let fallback = Arc::new(AtomicUsize::new(0));
        let router = router(0.99, 0.99, 0.99, counting(fallback.clone(), true))
            .route(Stage::Execute, "arbitrum", counting(specific.clone(), true));
        let pipeline = OpportunityPipeline::new(PipelineConfig::default(), router);

        pipeline.process(&signal().with_routing_key("arbitrum")).await.unwrap();
        pipeline.process(&signal()).await.unwrap();

        assert_eq!(specific.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_route_is_an_error() {
        let router = StageRouter::new().default_route(Stage::Spot, fixed(0.99));
        let pipeline = OpportunityPipeline::new(PipelineConfig::default(), router);

        let err = pipeline.process(&signal()).await.unwrap_err();

        assert!(matches!(err, PipelineError::NoRoute { stage: Stage::Validate, .. }));
        assert_eq!(pipeline.metrics().errors, 1);
    }

    #[tokio::test]
    async fn stage_error_and_timeout_surface() {
        let failing = router(
            0.99,
            0.99,
            0.99,
            stage_fn(|_| async { Err(StageError::Unavailable("signer offline".into())) }),
        );
        let pipeline = OpportunityPipeline::new(PipelineConfig::default(), failing);
        let err = pipeline.process(&signal()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Stage { stage: Stage::Execute, .. }));

        let slow = router(
            0.99,
            0.99,
            0.99,
            stage_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(StageOutput::accept(1.0, json!(null)))
            }),
        );
        let config = PipelineConfig {
            stage_timeout_ms: 20,
            ..PipelineConfig::default()
        };
        let pipeline = OpportunityPipeline::new(config, slow);
        let err = pipeline.process(&signal()).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageTimeout { stage: Stage::Execute, timeout_ms: 20 }));
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_clamped() {
        let pipeline = OpportunityPipeline::new(
            PipelineConfig::default(),
            router(1.7, f64::NAN, 0.99, fixed(0.99)),
        );
        let opp = pipeline.process(&signal()).await.unwrap();
        assert_eq!(opp.annotations()[0].confidence, 1.0);
        assert_eq!(opp.annotations()[1].confidence, 0.0);
        assert!(opp.executed_successfully());
    }
}
