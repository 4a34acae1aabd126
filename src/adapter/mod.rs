//! Remote access adapter — two ways to reach a relay server's configuration
//!
//! Every host is managed through exactly one of two backends, selected from
//! its stored credentials:
//! - the panel backend speaks HTTP to the relay's web management surface
//! - the shell backend drives the relay's embedded SQLite database over SSH
//!
//! Both expose the same four operations. Callers treat every failure kind
//! identically for cache purposes; the kinds exist so logs stay useful.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod panel;
pub mod shell;

pub use panel::{PanelClient, PanelPool};
pub use shell::ShellClient;

/// One relay (inbound) configuration entry on a host.
///
/// The numeric id is host-local and authoritative on the remote side.
/// Settings blobs are opaque JSON text — this engine never looks inside.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub remark: String,
    #[serde(default = "default_enabled")]
    pub enable: bool,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub settings: String,
    #[serde(default, rename = "streamSettings", alias = "stream_settings")]
    pub stream_settings: String,
    #[serde(default)]
    pub sniffing: String,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default, rename = "expiryTime", alias = "expiry_time")]
    pub expiry_time: i64,
}

fn default_enabled() -> bool {
    true
}

/// Adapter failure taxonomy.
///
/// The shell backend has no separate auth step visible to us, so rejected
/// keys/passwords surface as `Connect` there; `Auth` is panel-only.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Could not establish a session or shell at all
    #[error("connect failure: {0}")]
    Connect(String),
    /// The management surface answered but rejected the credentials
    #[error("auth failure: {0}")]
    Auth(String),
    /// Connection fine, the operation itself was refused
    #[error("remote rejected: {0}")]
    Rejected(String),
    /// The response did not parse
    #[error("decode failure: {0}")]
    Decode(String),
}

impl AdapterError {
    /// Short tag for log lines and the host's last-error string
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Connect(_) => "connect",
            AdapterError::Auth(_) => "auth",
            AdapterError::Rejected(_) => "rejected",
            AdapterError::Decode(_) => "decode",
        }
    }
}

/// The closed set of backends behind the capability interface
pub enum RemoteBackend {
    Panel(std::sync::Arc<PanelClient>),
    Shell(ShellClient),
}

impl RemoteBackend {
    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>, AdapterError> {
        match self {
            RemoteBackend::Panel(c) => c.list_nodes().await,
            RemoteBackend::Shell(c) => c.list_nodes().await,
        }
    }

    pub async fn add_node(&self, record: &NodeRecord) -> Result<(), AdapterError> {
        match self {
            RemoteBackend::Panel(c) => c.add_node(record).await,
            RemoteBackend::Shell(c) => c.add_node(record).await,
        }
    }

    pub async fn update_node(&self, id: i64, record: &NodeRecord) -> Result<(), AdapterError> {
        match self {
            RemoteBackend::Panel(c) => c.update_node(id, record).await,
            RemoteBackend::Shell(c) => c.update_node(id, record).await,
        }
    }

    pub async fn delete_node(&self, id: i64) -> Result<(), AdapterError> {
        match self {
            RemoteBackend::Panel(c) => c.delete_node(id).await,
            RemoteBackend::Shell(c) => c.delete_node(id).await,
        }
    }
}

/// Builds the right backend for a host from its stored credentials.
///
/// Selection is decided once per call site, not open-ended polymorphism:
/// shell when the host pushes heartbeats and carries shell coordinates
/// (a headless relay), panel when it has management credentials, and
/// nothing at all otherwise.
pub struct AdapterFactory {
    pub panels: PanelPool,
    data_dir: std::path::PathBuf,
    config: crate::config::FleetConfig,
}

impl AdapterFactory {
    pub fn new(data_dir: std::path::PathBuf, config: crate::config::FleetConfig) -> Self {
        Self {
            panels: PanelPool::new(config.http_timeout_secs),
            data_dir,
            config,
        }
    }

    pub fn backend_for(&self, host: &crate::hosts::Host) -> Option<RemoteBackend> {
        if host.heartbeat_capable && host.has_shell_coords() {
            let global_key = crate::config::load_global_ssh_key(&self.data_dir);
            return ShellClient::for_host(host, global_key, &self.config, &self.data_dir)
                .map(RemoteBackend::Shell);
        }
        if host.has_panel_credentials() {
            return Some(RemoteBackend::Panel(self.panels.client_for(host)));
        }
        None
    }

    /// Shell client regardless of heartbeat capability — used by the
    /// provisioning path, which runs before the host ever pushes.
    pub fn shell_for(&self, host: &crate::hosts::Host) -> Option<ShellClient> {
        let global_key = crate::config::load_global_ssh_key(&self.data_dir);
        ShellClient::for_host(host, global_key, &self.config, &self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::Host;

    fn factory() -> AdapterFactory {
        let dir = tempfile::tempdir().unwrap();
        let f = AdapterFactory::new(dir.path().to_path_buf(), crate::config::FleetConfig::default());
        std::mem::forget(dir);
        f
    }

    #[test]
    fn selection_prefers_shell_for_heartbeat_hosts_with_coords() {
        let f = factory();
        let mut h = Host::new("10.0.0.1:8080");
        h.heartbeat_capable = true;
        h.ssh_user = Some("root".into());
        h.ssh_auth = crate::hosts::SshAuth::Password;
        h.ssh_password = Some("pw".into());
        assert!(matches!(f.backend_for(&h), Some(RemoteBackend::Shell(_))));
    }

    #[test]
    fn selection_uses_panel_when_credentials_present() {
        let f = factory();
        let mut h = Host::new("10.0.0.1:8080");
        h.panel_user = Some("admin".into());
        h.panel_pass = Some("pw".into());
        assert!(matches!(f.backend_for(&h), Some(RemoteBackend::Panel(_))));
    }

    #[test]
    fn selection_yields_nothing_without_credentials() {
        let f = factory();
        let h = Host::new("10.0.0.1:8080");
        assert!(f.backend_for(&h).is_none());
    }

    #[test]
    fn node_record_decodes_panel_and_database_field_names() {
        let panel: NodeRecord = serde_json::from_str(
            r#"{"id":3,"remark":"edge","enable":true,"protocol":"vless","port":443,
                "settings":"{}","streamSettings":"{\"network\":\"tcp\"}","up":10,"down":20,
                "total":0,"expiryTime":0}"#,
        )
        .unwrap();
        assert_eq!(panel.stream_settings, "{\"network\":\"tcp\"}");

        let db: NodeRecord = serde_json::from_str(
            r#"{"id":3,"remark":"edge","protocol":"vless","port":443,
                "settings":"{}","stream_settings":"{}","up":10,"down":20}"#,
        )
        .unwrap();
        assert_eq!(db.stream_settings, "{}");
        assert!(db.enable, "enable defaults to true when absent");
    }
}
