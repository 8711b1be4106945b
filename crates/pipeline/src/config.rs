use std::time::Duration;

use serde::{Deserialize, Serialize};

use interlock_core::config::profiled_env_parse;

/// Opportunity pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Minimum confidence the Filter stage must report, whatever its own
    /// verdict.
    #[serde(default = "default_filter_floor")]
    pub filter_confidence_floor: f64,
    /// Upper bound on a single stage call.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_ms: u64,
}

fn default_filter_floor() -> f64 { 0.95 }
fn default_stage_timeout() -> u64 { 2_000 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            filter_confidence_floor: default_filter_floor(),
            stage_timeout_ms: default_stage_timeout(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms.max(1))
    }

    pub fn apply_env_overrides(&mut self, profile: &str) {
        if let Some(v) = profiled_env_parse(profile, "PIPELINE_FILTER_CONFIDENCE_FLOOR") {
            self.filter_confidence_floor = v;
        }
        if let Some(v) = profiled_env_parse(profile, "PIPELINE_STAGE_TIMEOUT_MS") {
            self.stage_timeout_ms = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_config_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.filter_confidence_floor, 0.95);
        assert_eq!(cfg.stage_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: PipelineConfig = serde_json::from_str(r#"{"stage_timeout_ms": 250}"#).unwrap();
        assert_eq!(cfg.stage_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.filter_confidence_floor, 0.95);
    }
}
