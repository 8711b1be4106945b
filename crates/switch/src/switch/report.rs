use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use interlock_core::TaskId;
use interlock_pipeline::{Opportunity, Signal};
use interlock_scheduler::TaskSnapshot;

/// How the pipeline run inside a switch ended. None of these block resumption.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Reached a terminal state: executed or rejected.
    Completed { opportunity: Box<Opportunity> },
    /// Aborted with a pipeline error (missing route, stage error, timeout).
    Failed { error: String },
    Panicked { message: String },
}

impl PipelineOutcome {
    pub fn opportunity(&self) -> Option<&Opportunity> {
        match self {
            PipelineOutcome::Completed { opportunity } => Some(opportunity.as_ref()),
            _ => None,
        }
    }
}

/// Everything one switch did.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchReport {
    pub switch_id: u64,
    pub signal: Signal,
    pub started_at: DateTime<Utc>,
    /// Task state captured before pausing.
    pub snapshot: Vec<TaskSnapshot>,
    /// Snapshotted tasks this switch moved to Paused.
    pub paused: Vec<TaskId>,
    /// Tasks moved back to Idle by the normal resume step.
    pub resumed: usize,
    /// `None` when an internal fault hit before the pipeline finished.
    pub outcome: Option<PipelineOutcome>,
    /// Set when an internal fault forced an emergency resume.
    pub fault: Option<String>,
    pub emergency_resumed: usize,
    pub elapsed: Duration,
    pub over_budget: bool,
    /// Qualifying signals that arrived while this switch held the lock.
    pub coalesced: Vec<Signal>,
}

/// What [`AtomicSwitch::on_signal`](super::AtomicSwitch::on_signal) did with a signal.
#[derive(Debug, Clone)]
pub enum SignalDisposition {
    /// Impact score not above the threshold; scheduling untouched.
    BelowThreshold,
    /// Another switch was in progress; the signal was folded into it.
    Coalesced,
    Switched(Box<SwitchReport>),
}

impl SignalDisposition {
    pub fn report(&self) -> Option<&SwitchReport> {
        match self {
            SignalDisposition::Switched(report) => Some(report.as_ref()),
            _ => None,
        }
    }
}

/// Switch counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SwitchMetrics {
    pub signals_received: u64,
    pub below_threshold: u64,
    pub switches: u64,
    pub coalesced: u64,
    pub budget_overruns: u64,
    pub emergency_resumes: u64,
    pub pipeline_errors: u64,
    pub pipeline_panics: u64,
    pub last_switch: Option<Duration>,
    pub max_switch: Duration,
}

impl SwitchMetrics {
    pub(super) fn record_switch(&mut self, report: &SwitchReport) {
        self.switches += 1;
        if report.over_budget {
            self.budget_overruns += 1;
        }
        if report.fault.is_some() {
            self.emergency_resumes += 1;
        }
        match &report.outcome {
            Some(PipelineOutcome::Failed { .. }) => self.pipeline_errors += 1,
            Some(PipelineOutcome::Panicked { .. }) => self.pipeline_panics += 1,
            _ => {}
        }
        self.last_switch = Some(report.elapsed);
        self.max_switch = self.max_switch.max(report.elapsed);
    }
}
