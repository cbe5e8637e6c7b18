//! Cloud-sync settings.
//!
//! Same loading flow as [`PoolConfig`](crate::PoolConfig): defaults, then an
//! optional JSON file, then `SHARD_FSM_SYNC_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::ConfigError;
use crate::config::{load_json, read_env_string, read_env_u64, read_env_usize};

/// OAuth client and storage API settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Consent page the user is sent to.
    pub auth_url: String,
    /// Token endpoint for code exchange and refresh.
    pub token_url: String,
    /// Metadata API base.
    pub api_url: String,
    /// Content upload API base.
    pub upload_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Where the consent page redirects with `?code=`.
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Remote folder holding the sessions.
    pub folder_name: String,
    /// Retries of a failed request before the sync run gives up.
    pub max_retries: u32,
    /// First retry delay; doubled on every further retry.
    pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            api_url: "https://www.googleapis.com/drive/v3".to_string(),
            upload_url: "https://www.googleapis.com/upload/drive/v3".to_string(),
            client_id: String::new(),
            client_secret: None,
            redirect_uri: "http://127.0.0.1:8765/".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/drive.file".to_string()],
            folder_name: "sessions".to_string(),
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl SyncConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = match path {
            Some(path) => load_json(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `SHARD_FSM_SYNC_*` overrides. Invalid values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = read_env_string("SHARD_FSM_SYNC_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = read_env_string("SHARD_FSM_SYNC_CLIENT_SECRET") {
            self.client_secret = Some(v);
        }
        if let Some(v) = read_env_string("SHARD_FSM_SYNC_REDIRECT_URI") {
            self.redirect_uri = v;
        }
        if let Some(v) = read_env_string("SHARD_FSM_SYNC_FOLDER") {
            self.folder_name = v;
        }
        if let Some(v) = read_env_usize("SHARD_FSM_SYNC_MAX_RETRIES", 0, 20) {
            self.max_retries = v as u32;
        }
        if let Some(v) = read_env_u64("SHARD_FSM_SYNC_BACKOFF_MS", 1, 600_000) {
            self.retry_backoff_ms = v;
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}
