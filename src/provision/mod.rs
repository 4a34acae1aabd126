//! Agent provisioning — pushes the heartbeat agent onto hosts over SSH
//!
//! The install script itself is operator-supplied (`agent_install.sh` in
//! the data dir) and out of scope here; this module templates the manager
//! coordinates into it, runs it remotely, and flips the host to
//! heartbeat-capable on success. Bulk runs are SSH-heavy, so they are
//! bounded well below the liveness pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::adapter::shell::detect_ssh_user;
use crate::cache::NodeCache;
use crate::config::FleetConfig;
use crate::hosts::HostRegistry;

const SCRIPT_FILE: &str = "agent_install.sh";

/// Fill the operator script's placeholders with this manager's coordinates
fn render_script(template: &str, manager_url: &str, token: &str, endpoint: &str) -> String {
    template
        .replace("__MANAGER_URL__", manager_url)
        .replace("__TOKEN__", token)
        .replace("__ENDPOINT__", endpoint)
}

pub struct Provisioner {
    registry: Arc<HostRegistry>,
    cache: Arc<NodeCache>,
    data_dir: PathBuf,
    config: FleetConfig,
}

impl Provisioner {
    pub fn new(
        registry: Arc<HostRegistry>,
        cache: Arc<NodeCache>,
        data_dir: PathBuf,
        config: FleetConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            data_dir,
            config,
        }
    }

    /// Install (or update) the agent on one host
    pub async fn install_agent(&self, endpoint: &str) -> Result<(), String> {
        let host = self
            .registry
            .get(endpoint)
            .ok_or_else(|| format!("unknown host {}", endpoint))?;

        let template = std::fs::read_to_string(self.data_dir.join(SCRIPT_FILE))
            .map_err(|_| format!("no agent install script at {}/{}", self.data_dir.display(), SCRIPT_FILE))?;
        let script = render_script(
            &template,
            &self.config.manager_base_url,
            &self.config.heartbeat_secret,
            endpoint,
        );

        let shell = self
            .cache
            .adapters()
            .shell_for(&host)
            .ok_or_else(|| format!("no usable SSH auth for {}", endpoint))?;

        shell
            .exec(&script, self.config.ssh_command_timeout_secs)
            .await
            .map_err(|e| e.to_string())?;

        self.registry.update(endpoint, |h| h.heartbeat_capable = true);
        info!("Agent installed on {}", endpoint);
        Ok(())
    }

    /// Install the agent on every host, bounded to the bulk SSH ceiling.
    /// Returns (succeeded, failed).
    pub async fn install_all(&self) -> (usize, usize) {
        use futures::StreamExt;

        let hosts = self.registry.list();
        let ok = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        futures::stream::iter(hosts)
            .for_each_concurrent(self.config.ssh_bulk_concurrency.max(1), |host| {
                let ok = &ok;
                let failed = &failed;
                async move {
                    match self.install_agent(&host.endpoint).await {
                        Ok(()) => {
                            ok.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!("Provisioning {} failed: {}", host.endpoint, e);
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;

        (ok.load(Ordering::Relaxed), failed.load(Ordering::Relaxed))
    }

    /// Try the conventional SSH login names against a freshly registered
    /// host and persist whichever one answers.
    pub async fn detect_and_store_ssh_user(&self, endpoint: &str) -> Option<String> {
        let host = self.registry.get(endpoint)?;
        let shell = self.cache.adapters().shell_for(&host)?;

        match detect_ssh_user(&shell).await {
            Some(user) => {
                info!("Detected SSH user {:?} for {}", user, endpoint);
                self.registry.update(endpoint, |h| h.ssh_user = Some(user.clone()));
                Some(user)
            }
            None => {
                warn!("No SSH login name worked for {}", endpoint);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::Host;

    #[test]
    fn render_substitutes_all_placeholders() {
        let template = "curl __MANAGER_URL__/api/heartbeat -d token=__TOKEN__ -d endpoint=__ENDPOINT__";
        let script = render_script(template, "http://mgr:8553", "s3cret", "10.0.0.1:8080");
        assert_eq!(
            script,
            "curl http://mgr:8553/api/heartbeat -d token=s3cret -d endpoint=10.0.0.1:8080"
        );
        assert!(!script.contains("__"));
    }

    #[tokio::test]
    async fn missing_script_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(HostRegistry::load(dir.path()));
        let mut host = Host::new("10.0.0.1:8080");
        host.ssh_user = Some("root".into());
        host.ssh_auth = crate::hosts::SshAuth::Password;
        host.ssh_password = Some("pw".into());
        registry.upsert(host);

        let cache = Arc::new(NodeCache::load(
            dir.path(),
            FleetConfig::default(),
            registry.clone(),
        ));
        let provisioner = Provisioner::new(
            registry,
            cache,
            dir.path().to_path_buf(),
            FleetConfig::default(),
        );

        let err = provisioner.install_agent("10.0.0.1:8080").await.unwrap_err();
        assert!(err.contains("agent_install.sh"));
    }

    #[tokio::test]
    async fn detection_needs_usable_auth_material() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(HostRegistry::load(dir.path()));
        // global-key auth selected, but no global key on disk
        let mut host = Host::new("10.0.0.1:8080");
        host.ssh_user = Some("root".into());
        registry.upsert(host);

        let cache = Arc::new(NodeCache::load(
            dir.path(),
            FleetConfig::default(),
            registry.clone(),
        ));
        let provisioner = Provisioner::new(
            registry,
            cache,
            dir.path().to_path_buf(),
            FleetConfig::default(),
        );

        assert!(provisioner.detect_and_store_ssh_user("10.0.0.1:8080").await.is_none());
    }
}
