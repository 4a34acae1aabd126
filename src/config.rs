//! Runtime configuration — persisted to `<data_dir>/config.json`
//!
//! Follows the same pattern as the alerting config: a JSON document where
//! every field has a serde default, so old documents keep loading as new
//! fields appear. Secrets can be overridden from the environment so they
//! never have to live on disk.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Tunables and secrets for the sync/liveness engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Shared secret agents must present on POST /api/heartbeat
    #[serde(default)]
    pub heartbeat_secret: String,

    /// Shared secret for POST /api/register
    #[serde(default)]
    pub register_secret: String,

    /// Base URL agents use to reach this manager (templated into the
    /// provisioning script)
    #[serde(default)]
    pub manager_base_url: String,

    // ── Liveness ──
    /// Max age of a heartbeat sample before it no longer counts as alive
    #[serde(default = "default_fresh_secs")]
    pub heartbeat_fresh_secs: u64,
    /// Consecutive stale evaluations before an offline alert fires
    #[serde(default = "default_offline_threshold")]
    pub offline_alert_threshold: u32,
    /// Seconds between liveness evaluation ticks
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    /// Concurrency ceiling for one liveness tick
    #[serde(default = "default_monitor_concurrency")]
    pub monitor_concurrency: usize,

    // ── Sync scheduler ──
    /// Epoch window — progress older than this starts a fresh pass
    #[serde(default = "default_epoch_secs")]
    pub sync_epoch_secs: u64,
    /// Pacing budget inside one epoch (leaves slack before the next)
    #[serde(default = "default_target_secs")]
    pub sync_target_secs: u64,
    /// Sleep after a per-host sync failure
    #[serde(default = "default_error_backoff")]
    pub sync_error_backoff_secs: u64,

    // ── Remote access ──
    /// Panel HTTP timeout per request
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// ssh ConnectTimeout
    #[serde(default = "default_ssh_connect_timeout")]
    pub ssh_connect_timeout_secs: u64,
    /// Ceiling for remote database writes
    #[serde(default = "default_ssh_write_timeout")]
    pub ssh_write_timeout_secs: u64,
    /// Ceiling for generic remote commands
    #[serde(default = "default_ssh_command_timeout")]
    pub ssh_command_timeout_secs: u64,
    /// Concurrency ceiling for bulk SSH work (provisioning)
    #[serde(default = "default_ssh_bulk_concurrency")]
    pub ssh_bulk_concurrency: usize,
}

fn default_fresh_secs() -> u64 { 15 }
fn default_offline_threshold() -> u32 { 3 }
fn default_monitor_interval() -> u64 { 120 }
fn default_monitor_concurrency() -> usize { 50 }
fn default_epoch_secs() -> u64 { 86400 }
fn default_target_secs() -> u64 { 84600 }
fn default_error_backoff() -> u64 { 60 }
fn default_http_timeout() -> u64 { 5 }
fn default_ssh_connect_timeout() -> u64 { 10 }
fn default_ssh_write_timeout() -> u64 { 60 }
fn default_ssh_command_timeout() -> u64 { 120 }
fn default_ssh_bulk_concurrency() -> usize { 10 }

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            heartbeat_secret: String::new(),
            register_secret: String::new(),
            manager_base_url: String::new(),
            heartbeat_fresh_secs: default_fresh_secs(),
            offline_alert_threshold: default_offline_threshold(),
            monitor_interval_secs: default_monitor_interval(),
            monitor_concurrency: default_monitor_concurrency(),
            sync_epoch_secs: default_epoch_secs(),
            sync_target_secs: default_target_secs(),
            sync_error_backoff_secs: default_error_backoff(),
            http_timeout_secs: default_http_timeout(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout(),
            ssh_write_timeout_secs: default_ssh_write_timeout(),
            ssh_command_timeout_secs: default_ssh_command_timeout(),
            ssh_bulk_concurrency: default_ssh_bulk_concurrency(),
        }
    }
}

impl FleetConfig {
    /// Load from `<data_dir>/config.json`, apply env overrides, and
    /// generate a heartbeat secret on first run so agents can enroll.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("config.json");
        let mut config: FleetConfig = crate::store::load_json_or_default(&path);

        if let Ok(secret) = std::env::var("WOLFRELAY_HEARTBEAT_SECRET") {
            config.heartbeat_secret = secret;
        }
        if let Ok(secret) = std::env::var("WOLFRELAY_REGISTER_SECRET") {
            config.register_secret = secret;
        }

        if config.heartbeat_secret.is_empty() {
            config.heartbeat_secret = uuid::Uuid::new_v4().simple().to_string();
            info!("Generated heartbeat secret (persisting to {})", path.display());
            crate::store::save_json_logged(&path, &config);
        }

        config
    }
}

/// Global fallback SSH private key — a single PEM string usable for any
/// host without per-host credentials.
pub fn load_global_ssh_key(data_dir: &Path) -> Option<String> {
    let path: PathBuf = data_dir.join("global_ssh_key");
    match std::fs::read_to_string(&path) {
        Ok(key) if !key.trim().is_empty() => Some(key),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let c = FleetConfig::default();
        assert_eq!(c.heartbeat_fresh_secs, 15);
        assert_eq!(c.offline_alert_threshold, 3);
        assert_eq!(c.monitor_interval_secs, 120);
        assert_eq!(c.sync_target_secs, 84600);
        assert_eq!(c.ssh_bulk_concurrency, 10);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let c: FleetConfig =
            serde_json::from_str(r#"{"heartbeat_secret":"s","offline_alert_threshold":5}"#).unwrap();
        assert_eq!(c.heartbeat_secret, "s");
        assert_eq!(c.offline_alert_threshold, 5);
        assert_eq!(c.monitor_interval_secs, 120);
    }

    #[test]
    fn missing_key_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_global_ssh_key(dir.path()).is_none());
    }
}
