//! Liveness monitor — classifies heartbeat-capable hosts online/offline
//!
//! Heartbeat delivery is best-effort: a single dropped sample must not
//! page anyone. The monitor therefore requires N consecutive stale
//! evaluations (default 3) before declaring a host offline, but recovers
//! on the very first fresh sample. Per-host alert state lives only in
//! memory; after a restart the worst case is one spurious
//! recovered/offline pair.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::NodeRecord;
use crate::hosts::HostRegistry;

/// Seconds since the unix epoch
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A passively-received status report from one host's agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSample {
    pub endpoint: String,
    /// When this manager received the sample (unix seconds)
    pub received_at: u64,
    /// Coarse resource metrics, opaque to this engine
    pub metrics: serde_json::Value,
    /// Optional embedded relay list pushed alongside the metrics
    #[serde(default)]
    pub nodes: Option<Vec<NodeRecord>>,
}

/// Latest sample per host. A newer sample replaces the older one
/// wholesale — there is no merging of partial fields.
#[derive(Default)]
pub struct HeartbeatCache {
    samples: RwLock<HashMap<String, HeartbeatSample>>,
}

impl HeartbeatCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: HeartbeatSample) {
        self.samples
            .write()
            .unwrap()
            .insert(sample.endpoint.clone(), sample);
    }

    pub fn get(&self, endpoint: &str) -> Option<HeartbeatSample> {
        self.samples.read().unwrap().get(endpoint).cloned()
    }

    /// Whether the host has a sample younger than `threshold_secs`
    pub fn fresh(&self, endpoint: &str, now: u64, threshold_secs: u64) -> bool {
        self.samples
            .read()
            .unwrap()
            .get(endpoint)
            .is_some_and(|s| now.saturating_sub(s.received_at) < threshold_secs)
    }
}

/// What kind of transition an alert describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Offline,
    Recovered,
}

/// A state transition handed to the alert dispatcher
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub endpoint: String,
    pub name: String,
    pub kind: TransitionKind,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Last alert dispatched for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastAlert {
    None,
    Online,
    Offline,
}

struct AlertState {
    failures: u32,
    last: LastAlert,
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            failures: 0,
            last: LastAlert::None,
        }
    }
}

pub struct LivenessMonitor {
    heartbeats: Arc<HeartbeatCache>,
    registry: Arc<HostRegistry>,
    states: Mutex<HashMap<String, AlertState>>,
    events: mpsc::UnboundedSender<AlertEvent>,
    fresh_secs: u64,
    offline_threshold: u32,
    concurrency: usize,
}

impl LivenessMonitor {
    pub fn new(
        heartbeats: Arc<HeartbeatCache>,
        registry: Arc<HostRegistry>,
        events: mpsc::UnboundedSender<AlertEvent>,
        config: &crate::config::FleetConfig,
    ) -> Self {
        Self {
            heartbeats,
            registry,
            states: Mutex::new(HashMap::new()),
            events,
            fresh_secs: config.heartbeat_fresh_secs,
            offline_threshold: config.offline_alert_threshold,
            concurrency: config.monitor_concurrency.max(1),
        }
    }

    /// One liveness decision for one host.
    ///
    /// Fresh sample ⇒ online: failure counter resets and a recovery fires
    /// unless the last alert already said online. No/stale sample ⇒
    /// offline: the counter climbs, and only the Nth consecutive miss
    /// (with no offline alert already standing) fires.
    fn evaluate(&self, endpoint: &str, name: &str, now: u64) -> Option<AlertEvent> {
        let online = self.heartbeats.fresh(endpoint, now, self.fresh_secs);

        let mut states = self.states.lock().unwrap();
        let state = states.entry(endpoint.to_string()).or_default();

        if online {
            state.failures = 0;
            if state.last != LastAlert::Online {
                state.last = LastAlert::Online;
                return Some(AlertEvent {
                    endpoint: endpoint.to_string(),
                    name: name.to_string(),
                    kind: TransitionKind::Recovered,
                    at: chrono::Utc::now(),
                });
            }
        } else {
            state.failures += 1;
            if state.failures >= self.offline_threshold && state.last != LastAlert::Offline {
                state.last = LastAlert::Offline;
                return Some(AlertEvent {
                    endpoint: endpoint.to_string(),
                    name: name.to_string(),
                    kind: TransitionKind::Offline,
                    at: chrono::Utc::now(),
                });
            }
        }
        None
    }

    /// Evaluate every heartbeat-capable host. Runs with a concurrency
    /// bound so one slow host cannot delay the others' classification.
    pub async fn tick(&self) {
        use futures::StreamExt;

        let now = now_secs();
        let hosts: Vec<_> = self
            .registry
            .list()
            .into_iter()
            .filter(|h| h.heartbeat_capable)
            .collect();

        debug!("Liveness tick over {} heartbeat hosts", hosts.len());

        futures::stream::iter(hosts)
            .for_each_concurrent(self.concurrency, |host| async move {
                let display = if host.name.is_empty() {
                    host.endpoint.clone()
                } else {
                    host.name.clone()
                };
                if let Some(event) = self.evaluate(&host.endpoint, &display, now) {
                    debug!("Liveness transition for {}: {:?}", host.endpoint, event.kind);
                    let _ = self.events.send(event);
                }
            })
            .await;
    }

    /// Periodic evaluation loop
    pub fn spawn_loop(self: &Arc<Self>, interval_secs: u64) {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
                monitor.tick().await;
            }
        });
    }
}
