use serde::{Deserialize, Serialize};

/// An external event that may interrupt scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub source: String,
    pub impact_score: f64,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Selects stage handlers; falls back to `source` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
}

impl Signal {
    pub fn new(source: impl Into<String>, impact_score: f64, payload: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            impact_score,
            payload,
            routing_key: None,
        }
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routing_key_defaults_to_source() {
        let s = Signal::new("mempool", 0.01, json!({}));
        assert_eq!(s.routing_key(), "mempool");
        assert_eq!(s.with_routing_key("arbitrum").routing_key(), "arbitrum");
    }

    #[test]
    fn parses_minimal_json_line() {
        let s: Signal = serde_json::from_str(r#"{"source":"feed","impact_score":0.006}"#).unwrap();
        assert_eq!(s.impact_score, 0.006);
        assert!(s.payload.is_null());
        assert_eq!(s.routing_key(), "feed");
    }
}
