//! Pool configuration with JSON file loading and environment overrides.
//!
//! Loading flow:
//! 1. Start with [`PoolConfig::default()`]
//! 2. If a config file is given and exists, parse it over the defaults
//! 3. Apply `SHARD_FSM_*` environment overrides (highest priority)

use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::ShutdownMode;
use crate::error::ConfigError;

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name, used as the worker thread name prefix.
    pub name: String,
    /// Number of worker threads.
    pub threads: usize,
    /// How `stop()` treats queued work.
    pub shutdown: ShutdownMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "shard-fsm".to_string(),
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            shutdown: ShutdownMode::Graceful,
        }
    }
}

impl PoolConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = match path {
            Some(path) => load_json(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `SHARD_FSM_NAME`, `SHARD_FSM_THREADS` and `SHARD_FSM_SHUTDOWN`.
    ///
    /// Invalid values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = read_env_string("SHARD_FSM_NAME") {
            self.name = v;
        }
        if let Some(v) = read_env_usize("SHARD_FSM_THREADS", 1, 1024) {
            self.threads = v;
        }
        if let Some(v) = read_env_string("SHARD_FSM_SHUTDOWN") {
            match v.to_ascii_lowercase().as_str() {
                "graceful" => self.shutdown = ShutdownMode::Graceful,
                "immediate" => self.shutdown = ShutdownMode::Immediate,
                _ => {}
            }
        }
    }
}

/// Parse a JSON file into `T`, falling back to `T::default()` when the file
/// does not exist.
pub fn load_json<T>(path: &Path) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        debug!(?path, "config file not found, using defaults");
        return Ok(T::default());
    }
    debug!(?path, "loading config from file");
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Read a non-empty environment variable.
pub fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Read an integer environment variable within `min..=max`.
pub fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    read_env_string(name)?
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|v| (min..=max).contains(v))
}

/// Read an integer environment variable within `min..=max`.
pub fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    read_env_string(name)?
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|v| (min..=max).contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_at_least_one_thread() {
        let config = PoolConfig::default();
        assert!(config.threads >= 1);
        assert_eq!(config.shutdown, ShutdownMode::Graceful);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"threads": 3}"#).unwrap();
        assert_eq!(config.threads, 3);
        assert_eq!(config.name, "shard-fsm");
    }

    #[test]
    fn shutdown_mode_parses_lowercase() {
        let config: PoolConfig = serde_json::from_str(r#"{"shutdown": "immediate"}"#).unwrap();
        assert_eq!(config.shutdown, ShutdownMode::Immediate);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config: PoolConfig =
            load_json(Path::new("/definitely/not/here/shard-fsm.json")).unwrap();
        assert_eq!(config, PoolConfig::default());
    }
}
