//! Node cache — last-known relay configuration per host
//!
//! The dominant read path is the dashboard asking for a host's nodes; that
//! must never touch the network. A refresh replaces a host's entry
//! wholesale with whatever the adapter read — there are no partial edits.
//! Mutations set a dirty flag and one background loop coalesces the disk
//! writes, so a burst of refreshes costs one document write, not fifty.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, AdapterFactory, NodeRecord};
use crate::hosts::{HostRegistry, HostStatus};

pub struct NodeCache {
    entries: RwLock<HashMap<String, Vec<NodeRecord>>>,
    dirty: AtomicBool,
    path: PathBuf,
    /// How often a call actually dispatched to a remote backend
    remote_fetches: AtomicU64,
    adapters: AdapterFactory,
    registry: Arc<HostRegistry>,
}

impl NodeCache {
    pub fn load(
        data_dir: &std::path::Path,
        config: crate::config::FleetConfig,
        registry: Arc<HostRegistry>,
    ) -> Self {
        let path = data_dir.join("nodes_cache.json");
        let entries: HashMap<String, Vec<NodeRecord>> = crate::store::load_json_or_default(&path);
        if !entries.is_empty() {
            info!(
                "Loaded cached nodes for {} hosts ({} records)",
                entries.len(),
                entries.values().map(|v| v.len()).sum::<usize>()
            );
        }
        Self {
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
            path,
            remote_fetches: AtomicU64::new(0),
            adapters: AdapterFactory::new(data_dir.to_path_buf(), config),
            registry,
        }
    }

    pub fn adapters(&self) -> &AdapterFactory {
        &self.adapters
    }

    pub fn remote_fetch_count(&self) -> u64 {
        self.remote_fetches.load(Ordering::Relaxed)
    }

    /// Cached entry, or None when this host has never been read
    pub fn peek(&self, endpoint: &str) -> Option<Vec<NodeRecord>> {
        self.entries.read().unwrap().get(endpoint).cloned()
    }

    /// The cache read path. `force == false` with an existing entry
    /// returns immediately — no network, no shell.
    pub async fn get(&self, endpoint: &str, force: bool) -> Vec<NodeRecord> {
        if !force {
            if let Some(entry) = self.peek(endpoint) {
                return entry;
            }
        }
        self.refresh(endpoint).await.unwrap_or_default()
    }

    /// Force a fresh read through the adapter. On success the entry is
    /// replaced wholesale and the host goes online; on failure the entry
    /// is left untouched and the status tag degrades per the failure kind.
    pub async fn refresh(&self, endpoint: &str) -> Result<Vec<NodeRecord>, AdapterError> {
        let Some(host) = self.registry.get(endpoint) else {
            return Ok(Vec::new());
        };
        let Some(backend) = self.adapters.backend_for(&host) else {
            // No usable credentials in either direction — nothing to call
            debug!("No backend for {}, returning empty set", endpoint);
            return Ok(Vec::new());
        };

        self.remote_fetches.fetch_add(1, Ordering::Relaxed);

        match backend.list_nodes().await {
            Ok(nodes) => {
                self.entries
                    .write()
                    .unwrap()
                    .insert(endpoint.to_string(), nodes.clone());
                self.mark_dirty();
                self.registry.set_status(endpoint, HostStatus::Online, None);
                self.adopt_display_name(endpoint, &nodes);
                Ok(nodes)
            }
            Err(e) => {
                let status = match e {
                    AdapterError::Connect(_) | AdapterError::Auth(_) => HostStatus::Error,
                    AdapterError::Rejected(_) | AdapterError::Decode(_) => HostStatus::Offline,
                };
                warn!("Refresh of {} failed ({}): {}", endpoint, e.kind(), e);
                self.registry.set_status(endpoint, status, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Absorb a node list that arrived by push (heartbeat payload)
    pub fn absorb(&self, endpoint: &str, nodes: Vec<NodeRecord>) {
        self.entries
            .write()
            .unwrap()
            .insert(endpoint.to_string(), nodes);
        self.mark_dirty();
    }

    pub fn remove(&self, endpoint: &str) {
        if self.entries.write().unwrap().remove(endpoint).is_some() {
            self.mark_dirty();
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Write the document if anything changed since the last flush
    pub fn flush_if_dirty(&self) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.flush();
        }
    }

    /// Unconditional flush — the scheduler calls this at epoch end
    pub fn flush(&self) {
        let snapshot = self.entries.read().unwrap().clone();
        crate::store::save_json_logged(&self.path, &snapshot);
    }

    /// Background loop coalescing dirty flags into periodic writes
    pub fn spawn_flush_loop(self: &Arc<Self>, interval_secs: u64) {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
                cache.flush_if_dirty();
            }
        });
    }

    /// Adopt the first relay's remark as the host display name when the
    /// two have drifted, preserving any flag/emoji prefix.
    fn adopt_display_name(&self, endpoint: &str, nodes: &[NodeRecord]) {
        let Some(remote_name) = nodes.first().map(|n| n.remark.trim()).filter(|r| !r.is_empty())
        else {
            return;
        };
        let Some(host) = self.registry.get(endpoint) else {
            return;
        };

        let (flag, text) = match host.name.split_once(' ') {
            Some((flag, rest)) => (Some(flag), rest.trim()),
            None => (None, host.name.as_str()),
        };
        if text == remote_name {
            return;
        }
        let new_name = match flag {
            Some(flag) => format!("{} {}", flag, remote_name),
            None => remote_name.to_string(),
        };
        debug!("Adopting display name {:?} for {}", new_name, endpoint);
        self.registry.update(endpoint, |h| h.name = new_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::Host;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture(host: Host) -> (Arc<HostRegistry>, NodeCache) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(HostRegistry::load(dir.path()));
        registry.upsert(host);
        let cache = NodeCache::load(
            dir.path(),
            crate::config::FleetConfig::default(),
            registry.clone(),
        );
        std::mem::forget(dir);
        (registry, cache)
    }

    fn panel_host(endpoint: &str) -> Host {
        let mut h = Host::new(endpoint);
        h.panel_user = Some("admin".into());
        h.panel_pass = Some("secret".into());
        h
    }

    fn sample_nodes() -> Vec<NodeRecord> {
        vec![NodeRecord {
            id: 1,
            remark: "edge".into(),
            protocol: "vmess".into(),
            port: 443,
            enable: true,
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn cached_get_never_dispatches_to_a_backend() {
        // Credentials point at an address that would fail loudly if dialed.
        let (_registry, cache) = fixture(panel_host("127.0.0.1:1"));
        cache.absorb("127.0.0.1:1", sample_nodes());

        let nodes = cache.get("127.0.0.1:1", false).await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(cache.remote_fetch_count(), 0, "cache hit must not dial out");
    }

    #[tokio::test]
    async fn host_without_credentials_returns_empty_without_calling_out() {
        let (_registry, cache) = fixture(Host::new("10.0.0.1:8080"));
        let nodes = cache.get("10.0.0.1:8080", true).await;
        assert!(nodes.is_empty());
        assert_eq!(cache.remote_fetch_count(), 0);
    }

    #[tokio::test]
    async fn connect_failure_then_success_end_to_end() {
        // Reserve a port, then free it so the first dial is refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = format!("127.0.0.1:{}", port);
        let (registry, cache) = fixture(panel_host(&endpoint));

        // First refresh: nothing is listening.
        assert!(matches!(
            cache.refresh(&endpoint).await,
            Err(AdapterError::Connect(_))
        ));
        assert_eq!(registry.get(&endpoint).unwrap().status, HostStatus::Error);
        assert!(registry.get(&endpoint).unwrap().last_error.is_some());
        assert!(cache.peek(&endpoint).is_none(), "failed refresh must not seed the cache");

        // The panel comes up on the same port.
        let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        let server = MockServer::builder().listener(listener).start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/inbound/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "obj": [{"id": 1, "remark": "edge", "enable": true, "protocol": "vmess",
                         "port": 443, "settings": "{}", "streamSettings": "{}",
                         "up": 0, "down": 0, "total": 0, "expiryTime": 0}]
            })))
            .mount(&server)
            .await;

        let nodes = cache.refresh(&endpoint).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(registry.get(&endpoint).unwrap().status, HostStatus::Online);
        assert_eq!(cache.peek(&endpoint).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_leaves_entry_untouched_and_sets_offline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/inbound/list"))
            .respond_with(ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"success": false, "msg": "db locked"})))
            .mount(&server)
            .await;

        let endpoint = server.uri().trim_start_matches("http://").to_string();
        let (registry, cache) = fixture(panel_host(&endpoint));
        cache.absorb(&endpoint, sample_nodes());

        assert!(cache.refresh(&endpoint).await.is_err());
        assert_eq!(registry.get(&endpoint).unwrap().status, HostStatus::Offline);
        assert_eq!(
            cache.peek(&endpoint).unwrap(),
            sample_nodes(),
            "failure must not clobber the last good entry"
        );
    }

    #[tokio::test]
    async fn flush_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(HostRegistry::load(dir.path()));
        let cache = NodeCache::load(
            dir.path(),
            crate::config::FleetConfig::default(),
            registry.clone(),
        );

        cache.absorb("10.0.0.1:80", sample_nodes());
        cache.flush_if_dirty();

        let reloaded = NodeCache::load(
            dir.path(),
            crate::config::FleetConfig::default(),
            registry,
        );
        assert_eq!(reloaded.peek("10.0.0.1:80").unwrap(), sample_nodes());
    }

    #[tokio::test]
    async fn display_name_adoption_preserves_flag_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/inbound/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "obj": [{"id": 1, "remark": "Berlin", "enable": true, "protocol": "vmess",
                         "port": 443, "settings": "{}", "streamSettings": "{}",
                         "up": 0, "down": 0, "total": 0, "expiryTime": 0}]
            })))
            .mount(&server)
            .await;

        let endpoint = server.uri().trim_start_matches("http://").to_string();
        let mut host = panel_host(&endpoint);
        host.name = "🇩🇪 Frankfurt".to_string();
        let (registry, cache) = fixture(host);

        cache.refresh(&endpoint).await.unwrap();
        assert_eq!(registry.get(&endpoint).unwrap().name, "🇩🇪 Berlin");
    }
}
