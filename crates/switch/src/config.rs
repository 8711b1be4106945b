use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use interlock_core::config::{active_profile, load_dotenv, profile_label, profiled_env_parse};
use interlock_core::StorageConfig;
use interlock_discovery::BusConfig;
use interlock_pipeline::PipelineConfig;
use interlock_scheduler::SchedulerConfig;

use crate::error::ConfigError;

// ── Switch ──────────────────────────────────────────────────────────

/// Atomic switch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// A signal switches only when its impact score is strictly greater.
    #[serde(default = "default_impact_threshold")]
    pub impact_threshold: f64,
    /// Wall-time budget for snapshot through resume. Overruns only warn.
    #[serde(default = "default_switch_budget")]
    pub switch_budget_ms: u64,
    /// Idle tasks due within this window are paused along with running ones.
    #[serde(default = "default_imminent_window")]
    pub imminent_window_ms: u64,
    /// Delay applied to every paused task after an internal switch fault.
    #[serde(default = "default_emergency_resume_delay")]
    pub emergency_resume_delay_ms: u64,
    /// Switch reports retained for inspection.
    #[serde(default = "default_report_history")]
    pub report_history: usize,
}

fn default_impact_threshold() -> f64 { 0.005 }
fn default_switch_budget() -> u64 { 250 }
fn default_imminent_window() -> u64 { 1_000 }
fn default_emergency_resume_delay() -> u64 { 5_000 }
fn default_report_history() -> usize { 32 }

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            impact_threshold: default_impact_threshold(),
            switch_budget_ms: default_switch_budget(),
            imminent_window_ms: default_imminent_window(),
            emergency_resume_delay_ms: default_emergency_resume_delay(),
            report_history: default_report_history(),
        }
    }
}

impl SwitchConfig {
    pub fn switch_budget(&self) -> Duration {
        Duration::from_millis(self.switch_budget_ms)
    }

    pub fn imminent_window(&self) -> Duration {
        Duration::from_millis(self.imminent_window_ms)
    }

    pub fn emergency_resume_delay(&self) -> Duration {
        Duration::from_millis(self.emergency_resume_delay_ms)
    }

    pub fn apply_env_overrides(&mut self, profile: &str) {
        if let Some(v) = profiled_env_parse(profile, "SWITCH_IMPACT_THRESHOLD") {
            self.impact_threshold = v;
        }
        if let Some(v) = profiled_env_parse(profile, "SWITCH_BUDGET_MS") {
            self.switch_budget_ms = v;
        }
        if let Some(v) = profiled_env_parse(profile, "SWITCH_IMMINENT_WINDOW_MS") {
            self.imminent_window_ms = v;
        }
        if let Some(v) = profiled_env_parse(profile, "SWITCH_EMERGENCY_RESUME_DELAY_MS") {
            self.emergency_resume_delay_ms = v;
        }
    }
}

// ── Whole process ───────────────────────────────────────────────────

/// Configuration of every component, parsed from TOML.
///
/// ```toml
/// [scheduler]
/// max_concurrent_tasks = 8
///
/// [switch]
/// impact_threshold = 0.005
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterlockConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub discovery: BusConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub switch: SwitchConfig,
}

impl InterlockConfig {
    /// Parse config from a TOML string. No environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path. No environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Load `.env`, read `path` (or defaults), then apply environment
    /// overrides for the active profile.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        load_dotenv();
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        let profile = active_profile();
        config.apply_env_overrides(&profile);
        config.validate()?;
        info!(profile = profile_label(&profile), "Loaded interlock config");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, profile: &str) {
        self.storage.apply_env_overrides(profile);
        self.scheduler.apply_env_overrides(profile);
        self.discovery.apply_env_overrides(profile);
        self.pipeline.apply_env_overrides(profile);
        self.switch.apply_env_overrides(profile);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.switch.impact_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "switch.impact_threshold must be a non-negative number, got {threshold}"
            )));
        }
        let floor = self.pipeline.filter_confidence_floor;
        if !(0.0..=1.0).contains(&floor) {
            return Err(ConfigError::Invalid(format!(
                "pipeline.filter_confidence_floor must be within [0, 1], got {floor}"
            )));
        }
        if self.discovery.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "discovery.history_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
