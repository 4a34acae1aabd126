//! Host registry — the fleet of managed relay servers
//!
//! Each host is one remote server running either a web-managed relay panel
//! or a headless relay process reachable only over SSH. Identity is the
//! endpoint string; hosts are kept in insertion order (the sync scheduler
//! paginates by index) with no duplicate endpoints.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::debug;

/// Last-observed reachability of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Unknown,
    Online,
    Offline,
    Error,
}

impl Default for HostStatus {
    fn default() -> Self {
        HostStatus::Unknown
    }
}

/// How to authenticate the SSH transport for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshAuth {
    /// The shared fleet key from `<data_dir>/global_ssh_key`
    GlobalKey,
    /// Per-host password
    Password,
    /// Per-host private key
    Key,
}

impl Default for SshAuth {
    fn default() -> Self {
        SshAuth::GlobalKey
    }
}

/// One managed remote server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Unique endpoint — URL or bare host:port. This is the host's identity.
    pub endpoint: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: String,

    // ── Panel credentials (HTTP management surface) ──
    #[serde(default)]
    pub panel_user: Option<String>,
    #[serde(default)]
    pub panel_pass: Option<String>,
    /// Optional path segment prepended to login discovery candidates
    #[serde(default)]
    pub panel_path_prefix: Option<String>,

    // ── Shell coordinates ──
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_auth: SshAuth,
    #[serde(default)]
    pub ssh_password: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,

    /// Whether this host pushes its own heartbeats (refreshed by push, not pull)
    #[serde(default)]
    pub heartbeat_capable: bool,

    #[serde(default)]
    pub status: HostStatus,
    /// Human-readable description of the last adapter failure
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Host {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            name: String::new(),
            group: String::new(),
            panel_user: None,
            panel_pass: None,
            panel_path_prefix: None,
            ssh_host: None,
            ssh_port: None,
            ssh_user: None,
            ssh_auth: SshAuth::GlobalKey,
            ssh_password: None,
            ssh_key: None,
            heartbeat_capable: false,
            status: HostStatus::Unknown,
            last_error: None,
        }
    }

    /// Whether this host has usable panel credentials
    pub fn has_panel_credentials(&self) -> bool {
        matches!((&self.panel_user, &self.panel_pass), (Some(u), Some(p)) if !u.is_empty() && !p.is_empty())
    }

    /// Whether this host carries shell-access coordinates
    pub fn has_shell_coords(&self) -> bool {
        self.ssh_user.as_deref().is_some_and(|u| !u.is_empty())
            || self.ssh_host.as_deref().is_some_and(|h| !h.is_empty())
    }

    /// The address the SSH transport should dial: explicit ssh_host if
    /// set, otherwise the bare IP/hostname from the endpoint.
    pub fn ssh_address(&self) -> String {
        match self.ssh_host.as_deref() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => bare_host(&self.endpoint),
        }
    }
}

/// Strip scheme and port from an endpoint, leaving the bare host/IP.
pub fn bare_host(endpoint: &str) -> String {
    let without_scheme = endpoint.split("://").last().unwrap_or(endpoint);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .split(':')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

/// Scheme-insensitive endpoint form, used to reject duplicates.
fn normalized(endpoint: &str) -> String {
    endpoint
        .trim()
        .trim_end_matches('/')
        .split("://")
        .last()
        .unwrap_or(endpoint)
        .to_string()
}

/// The ordered host collection, persisted to `hosts.json`
pub struct HostRegistry {
    hosts: RwLock<Vec<Host>>,
    path: PathBuf,
}

impl HostRegistry {
    pub fn load(data_dir: &std::path::Path) -> Self {
        let path = data_dir.join("hosts.json");
        let hosts: Vec<Host> = crate::store::load_json_or_default(&path);
        debug!("Loaded {} hosts from {}", hosts.len(), path.display());
        Self {
            hosts: RwLock::new(hosts),
            path,
        }
    }

    fn save(&self) {
        let hosts = self.hosts.read().unwrap();
        crate::store::save_json_logged(&self.path, &*hosts);
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap().len()
    }

    pub fn list(&self) -> Vec<Host> {
        self.hosts.read().unwrap().clone()
    }

    /// Host at a scheduler cursor position
    pub fn at(&self, index: usize) -> Option<Host> {
        self.hosts.read().unwrap().get(index).cloned()
    }

    pub fn get(&self, endpoint: &str) -> Option<Host> {
        let hosts = self.hosts.read().unwrap();
        hosts.iter().find(|h| h.endpoint == endpoint).cloned()
    }

    /// Resolve an endpoint reported by an agent: exact match first, then
    /// bare-IP fallback (strip scheme/port from both sides and compare).
    pub fn resolve_endpoint(&self, reported: &str) -> Option<String> {
        let hosts = self.hosts.read().unwrap();
        if let Some(h) = hosts.iter().find(|h| h.endpoint == reported) {
            return Some(h.endpoint.clone());
        }
        let ip = bare_host(reported);
        if ip.is_empty() {
            return None;
        }
        hosts
            .iter()
            .find(|h| bare_host(&h.endpoint) == ip)
            .map(|h| h.endpoint.clone())
    }

    /// Insert or update a host, keyed by scheme-insensitive endpoint.
    /// Returns true when a new host was appended.
    pub fn upsert(&self, host: Host) -> bool {
        let appended = {
            let mut hosts = self.hosts.write().unwrap();
            let key = normalized(&host.endpoint);
            match hosts.iter_mut().find(|h| normalized(&h.endpoint) == key) {
                Some(existing) => {
                    *existing = host;
                    false
                }
                None => {
                    hosts.push(host);
                    true
                }
            }
        };
        self.save();
        appended
    }

    pub fn remove(&self, endpoint: &str) -> bool {
        let removed = {
            let mut hosts = self.hosts.write().unwrap();
            let before = hosts.len();
            hosts.retain(|h| h.endpoint != endpoint);
            hosts.len() != before
        };
        if removed {
            self.save();
        }
        removed
    }

    /// Update a host in place without replacing the whole record
    pub fn update<F: FnOnce(&mut Host)>(&self, endpoint: &str, f: F) -> bool {
        let updated = {
            let mut hosts = self.hosts.write().unwrap();
            match hosts.iter_mut().find(|h| h.endpoint == endpoint) {
                Some(host) => {
                    f(host);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.save();
        }
        updated
    }

    /// Set the status tag and last-error string. Status churn is frequent,
    /// so this deliberately skips the disk write — status is rebuilt by
    /// the next refresh after a restart anyway.
    pub fn set_status(&self, endpoint: &str, status: HostStatus, last_error: Option<String>) {
        let mut hosts = self.hosts.write().unwrap();
        if let Some(host) = hosts.iter_mut().find(|h| h.endpoint == endpoint) {
            host.status = status;
            host.last_error = last_error;
        }
    }
}
