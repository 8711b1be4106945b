use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Env var selecting the active profile (e.g. `PROD`).
pub const PROFILE_VAR: &str = "INTERLOCK_PROFILE";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Active profile name, upper-cased. Empty string means the default profile.
pub fn active_profile() -> String {
    env_or(PROFILE_VAR, "").to_uppercase()
}

pub fn profile_label(profile: &str) -> &str {
    if profile.is_empty() { "default" } else { profile }
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
pub fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Parse a profiled env var. Unparseable values are logged and ignored.
pub fn profiled_env_parse<T: FromStr>(profile: &str, key: &str) -> Option<T> {
    let raw = profiled_env_opt(profile, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

// ── Storage ───────────────────────────────────────────────────

/// Which [`DurableStore`](crate::DurableStore) backs discovery flushes and
/// task-state snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Memory,
    File,
}

impl FromStr for StorageBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,
    /// Root directory for the file backend.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_backend() -> StorageBackendKind { StorageBackendKind::File }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Apply `STORAGE_BACKEND` / `DATA_DIR` overrides for the given profile.
    pub fn apply_env_overrides(&mut self, profile: &str) {
        if let Some(kind) = profiled_env_parse(profile, "STORAGE_BACKEND") {
            self.backend = kind;
        }
        if let Some(dir) = profiled_env_opt(profile, "DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }
}
