//! The atomic switch controller.
//!
//! One switch at a time: snapshot → pause → pipeline → resume → measure.
//! Any internal fault during the middle steps falls back to an emergency
//! resume, so a switch can never leave tasks paused.
//!
//! - `report`: outcome, report, disposition, and metric types
//! - `listener`: drives the switch from an mpsc signal channel

mod listener;
mod report;

pub use self::report::{PipelineOutcome, SignalDisposition, SwitchMetrics, SwitchReport};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use interlock_core::{panic_message, RingBuffer, TaskId};
use interlock_pipeline::{OpportunityPipeline, Signal};
use interlock_scheduler::TaskSnapshot;

use crate::config::SwitchConfig;
use crate::control::SchedulingControl;
use crate::error::SwitchError;

/// What steps 1–4 managed to do before finishing or faulting.
#[derive(Default)]
struct Progress {
    snapshot: Vec<TaskSnapshot>,
    paused: Vec<TaskId>,
    outcome: Option<PipelineOutcome>,
    resumed: usize,
}

pub struct AtomicSwitch {
    config: SwitchConfig,
    control: Arc<dyn SchedulingControl>,
    pipeline: Arc<OpportunityPipeline>,
    /// Held for the whole switch. `try_lock` failure means coalesce.
    gate: tokio::sync::Mutex<()>,
    /// Signals coalesced into the switch in progress.
    pending: Mutex<Vec<Signal>>,
    next_switch_id: AtomicU64,
    metrics: RwLock<SwitchMetrics>,
    reports: RwLock<RingBuffer<SwitchReport>>,
}

impl AtomicSwitch {
    pub fn new(
        config: SwitchConfig,
        control: Arc<dyn SchedulingControl>,
        pipeline: Arc<OpportunityPipeline>,
    ) -> Self {
        let reports = RingBuffer::new(config.report_history);
        Self {
            config,
            control,
            pipeline,
            gate: tokio::sync::Mutex::new(()),
            pending: Mutex::new(Vec::new()),
            next_switch_id: AtomicU64::new(1),
            metrics: RwLock::new(SwitchMetrics::default()),
            reports: RwLock::new(reports),
        }
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    pub fn metrics(&self) -> SwitchMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The last `n` switch reports, oldest first.
    pub fn recent_reports(&self, n: usize) -> Vec<SwitchReport> {
        self.reports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tail(n)
    }

    /// Whether a switch currently holds the gate.
    pub fn is_switching(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Strictly above the threshold. NaN never qualifies.
    pub fn qualifies(&self, signal: &Signal) -> bool {
        signal.impact_score > self.config.impact_threshold
    }

    /// Handle one signal: ignore it, coalesce it, or run a full switch.
    #[instrument(skip_all, fields(source = %signal.source, impact_score = signal.impact_score))]
    pub async fn on_signal(&self, signal: Signal) -> SignalDisposition {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .signals_received += 1;

        if !self.qualifies(&signal) {
            self.metrics
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .below_threshold += 1;
            debug!(threshold = self.config.impact_threshold, "Signal below threshold");
            return SignalDisposition::BelowThreshold;
        }

        let Ok(gate) = self.gate.try_lock() else {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(signal);
            self.metrics
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .coalesced += 1;
            info!("Switch in progress, coalescing signal");
            return SignalDisposition::Coalesced;
        };

        let mut report = self.switch(signal).await;
        drop(gate);
        // Anything that failed `try_lock` before the gate dropped belongs here.
        report.coalesced = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        info!(
            switch_id = report.switch_id,
            paused = report.paused.len(),
            resumed = report.resumed,
            coalesced = report.coalesced.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            faulted = report.fault.is_some(),
            "Switch complete"
        );

        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_switch(&report);
        self.reports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        SignalDisposition::Switched(Box::new(report))
    }

    async fn switch(&self, signal: Signal) -> SwitchReport {
        let switch_id = self.next_switch_id.fetch_add(1, Ordering::Relaxed);
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut progress = Progress::default();

        let steps = AssertUnwindSafe(self.run_steps(&signal, &mut progress))
            .catch_unwind()
            .await;
        let elapsed = clock.elapsed();

        let fault = match steps {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(SwitchError::Panicked(panic_message(panic.as_ref()).to_string())),
        };
        let emergency_resumed = match &fault {
            Some(e) => {
                error!(switch_id, error = %e, "Switch fault, emergency-resuming all paused tasks");
                self.control.emergency_resume(self.config.emergency_resume_delay())
            }
            None => 0,
        };

        let elapsed_ms = elapsed.as_millis() as u64;
        let over_budget = elapsed > self.config.switch_budget();
        if over_budget {
            warn!(
                switch_id,
                elapsed_ms,
                budget_ms = self.config.switch_budget_ms,
                "Switch exceeded its time budget"
            );
        }

        SwitchReport {
            switch_id,
            signal,
            started_at,
            snapshot: progress.snapshot,
            paused: progress.paused,
            resumed: progress.resumed,
            outcome: progress.outcome,
            fault: fault.map(|e| e.to_string()),
            emergency_resumed,
            elapsed,
            over_budget,
            coalesced: Vec::new(),
        }
    }

    /// Steps 1–4. Records into `progress` as it goes so a fault still
    /// reports what happened.
    async fn run_steps(&self, signal: &Signal, progress: &mut Progress) -> Result<(), SwitchError> {
        progress.snapshot = self.control.snapshot_imminent(self.config.imminent_window());
        let ids: Vec<TaskId> = progress.snapshot.iter().map(|s| s.id.clone()).collect();

        progress.paused = self.control.pause_tasks(&ids)?;
        debug!(snapshotted = ids.len(), paused = progress.paused.len(), "Paused tasks");

        progress.outcome = Some(self.evaluate(signal).await);

        progress.resumed = self.control.resume_tasks_now(&ids)?;
        Ok(())
    }

    /// Run the pipeline. Errors and panics become outcomes.
    async fn evaluate(&self, signal: &Signal) -> PipelineOutcome {
        match AssertUnwindSafe(self.pipeline.process(signal)).catch_unwind().await {
            Ok(Ok(opportunity)) => PipelineOutcome::Completed {
                opportunity: Box::new(opportunity),
            },
            Ok(Err(e)) => {
                warn!(error = %e, "Pipeline failed during switch");
                PipelineOutcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref()).to_string();
                error!(panic = %message, "Pipeline panicked during switch");
                PipelineOutcome::Panicked { message }
            }
        }
    }
}
