use std::time::Duration;

use serde::{Deserialize, Serialize};

use interlock_core::config::{profiled_env_opt, profiled_env_parse};

/// Discovery bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Discoveries retained in memory (oldest evicted first).
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Seconds between durable flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_seconds: u64,
    /// Store key the history snapshot is written under.
    #[serde(default = "default_history_key")]
    pub history_key: String,
}

fn default_history_capacity() -> usize { 500 }
fn default_flush_interval() -> u64 { 30 }
fn default_history_key() -> String { "discovery/history".into() }

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            flush_interval_seconds: default_flush_interval(),
            history_key: default_history_key(),
        }
    }
}

impl BusConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds.max(1))
    }

    pub fn apply_env_overrides(&mut self, profile: &str) {
        if let Some(v) = profiled_env_parse(profile, "DISCOVERY_HISTORY_CAPACITY") {
            self.history_capacity = v;
        }
        if let Some(v) = profiled_env_parse(profile, "DISCOVERY_FLUSH_INTERVAL_SECONDS") {
            self.flush_interval_seconds = v;
        }
        if let Some(v) = profiled_env_opt(profile, "DISCOVERY_HISTORY_KEY") {
            self.history_key = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_config_defaults() {
        let cfg = BusConfig::default();
        assert_eq!(cfg.history_capacity, 500);
        assert_eq!(cfg.flush_interval(), Duration::from_secs(30));
        assert_eq!(cfg.history_key, "discovery/history");
    }

    #[test]
    fn zero_flush_interval_is_clamped() {
        let cfg = BusConfig {
            flush_interval_seconds: 0,
            ..BusConfig::default()
        };
        assert_eq!(cfg.flush_interval(), Duration::from_secs(1));
    }
}
