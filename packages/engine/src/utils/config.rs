// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Loaded from an optional JSON file, then overridden by environment
//! variables (`AGENTNET_THREADS`, `AGENTNET_STEP_DELAY_MS`).

use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use std::path::Path;
use std::thread;
use tracing::debug;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker cap for the experiments manager (number of experiments
    /// stepped in parallel). Defaults to the hardware parallelism.
    pub threads: usize,

    /// Default sleep between steps, in milliseconds. Zero disables the
    /// inter-step delay.
    pub step_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism().map_or(1, |n| n.get()),
            step_delay_ms: 0,
        }
    }
}

impl EngineConfig {
    /// Load the configuration: defaults, then file, then environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                serde_json::from_str(&raw).map_err(|e| {
                    EngineError::Config(format!("unreadable config file {}: {}", p.display(), e))
                })?
            }
            None => Self::default(),
        };

        if let Some(threads) = read_env_var("AGENTNET_THREADS")? {
            config.threads = threads;
        }
        if let Some(delay) = read_env_var("AGENTNET_STEP_DELAY_MS")? {
            config.step_delay_ms = delay;
        }

        debug!(?config, "configuration loaded");
        Ok(config)
    }
}

fn read_env_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| EngineError::Config(format!("{} has an unparseable value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.threads >= 1);
        assert_eq!(config.step_delay_ms, 0);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"threads": 3, "step_delay_ms": 25}}"#).unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.threads, 3);
        assert_eq!(config.step_delay_ms, 25);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"thread_count": 3}"#).unwrap();
        assert!(EngineConfig::load(Some(&path)).is_err());
    }
}
