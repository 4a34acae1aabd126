//! REST API for the dashboard layer and agent communication
//!
//! Two inbound surfaces share this table: the heartbeat/registration
//! endpoints agents call (gated by shared secrets), and the host/node
//! management routes the dashboard calls. Session handling for the
//! dashboard lives in the deployment's fronting proxy, not here.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::adapter::NodeRecord;
use crate::cache::NodeCache;
use crate::config::FleetConfig;
use crate::hosts::{Host, HostRegistry, HostStatus};
use crate::monitor::{now_secs, HeartbeatCache, HeartbeatSample};
use crate::provision::Provisioner;

/// Shared application state
pub struct AppState {
    pub registry: Arc<HostRegistry>,
    pub cache: Arc<NodeCache>,
    pub heartbeats: Arc<HeartbeatCache>,
    pub provisioner: Arc<Provisioner>,
    pub config: FleetConfig,
    pub data_dir: PathBuf,
}

/// Validate a shared secret from a request body.
/// Constant-time comparison to prevent timing attacks.
pub fn validate_shared_secret(provided: &str, expected: &str) -> bool {
    if provided.is_empty() || expected.is_empty() {
        return false;
    }
    provided.len() == expected.len()
        && provided
            .as_bytes()
            .iter()
            .zip(expected.as_bytes().iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Host record with credential fields masked for dashboard listings
fn sanitize_host(host: &Host) -> serde_json::Value {
    let mut value = serde_json::to_value(host).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        for secret in ["panel_pass", "ssh_password", "ssh_key"] {
            if obj.get(secret).is_some_and(|v| !v.is_null()) {
                obj.insert(secret.to_string(), serde_json::Value::String("********".into()));
            }
        }
    }
    value
}

// ─── Agent-facing API ───

#[derive(Deserialize)]
pub struct HeartbeatPush {
    pub token: String,
    pub endpoint: String,
    #[serde(default)]
    pub nodes: Option<Vec<NodeRecord>>,
    /// Everything else in the body is coarse resource metrics
    #[serde(flatten)]
    pub metrics: serde_json::Map<String, serde_json::Value>,
}

/// POST /api/heartbeat — agent status push
pub async fn heartbeat(state: web::Data<AppState>, body: web::Json<HeartbeatPush>) -> HttpResponse {
    if !validate_shared_secret(&body.token, &state.config.heartbeat_secret) {
        return HttpResponse::Forbidden().json(serde_json::json!({ "error": "Invalid token" }));
    }

    // Exact endpoint match first, bare-IP fallback second
    let Some(endpoint) = state.registry.resolve_endpoint(&body.endpoint) else {
        return HttpResponse::Ok().json(serde_json::json!({ "success": true, "matched": false }));
    };

    let host = state.registry.get(&endpoint);
    if host.as_ref().is_some_and(|h| !h.heartbeat_capable) {
        state.registry.update(&endpoint, |h| h.heartbeat_capable = true);
    }

    state.heartbeats.record(HeartbeatSample {
        endpoint: endpoint.clone(),
        received_at: now_secs(),
        metrics: serde_json::Value::Object(body.metrics.clone()),
        nodes: body.nodes.clone(),
    });

    if let Some(nodes) = &body.nodes {
        state.cache.absorb(&endpoint, nodes.clone());
    }

    HttpResponse::Ok().json(serde_json::json!({ "success": true, "matched": true }))
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub secret: String,
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
}

/// POST /api/register — self-registration from a provisioning script
pub async fn register(state: web::Data<AppState>, body: web::Json<RegisterRequest>) -> HttpResponse {
    if !validate_shared_secret(&body.secret, &state.config.register_secret) {
        return HttpResponse::Forbidden().json(serde_json::json!({ "error": "Invalid secret" }));
    }

    let endpoint = format!("http://{}:{}", body.ip, body.port);
    let mut host = state.registry.get(&endpoint).unwrap_or_else(|| Host::new(&endpoint));
    host.name = body.alias.clone().unwrap_or_else(|| format!("Auto-{}", body.ip));
    host.group = "auto-registered".to_string();
    host.panel_user = Some(body.username.clone());
    host.panel_pass = Some(body.password.clone());
    host.ssh_port = body.ssh_port;

    let added = state.registry.upsert(host);
    info!("Auto-registered host {} (new: {})", endpoint, added);

    // Work out which login name the machine accepts, off this request
    let provisioner = state.provisioner.clone();
    let detect_endpoint = endpoint.clone();
    tokio::spawn(async move {
        provisioner.detect_and_store_ssh_user(&detect_endpoint).await;
    });

    HttpResponse::Ok().json(serde_json::json!({ "success": true, "endpoint": endpoint }))
}

// ─── Dashboard API ───

#[derive(Deserialize)]
pub struct HostQuery {
    pub host: String,
}

/// GET /api/nodes?host= — cache read, no forced refresh
pub async fn get_nodes(state: web::Data<AppState>, query: web::Query<HostQuery>) -> HttpResponse {
    let nodes = state.cache.get(&query.host, false).await;
    HttpResponse::Ok().json(nodes)
}

/// GET /api/hosts — all hosts with status tags, secrets masked
pub async fn get_hosts(state: web::Data<AppState>) -> HttpResponse {
    let hosts: Vec<_> = state.registry.list().iter().map(sanitize_host).collect();
    HttpResponse::Ok().json(hosts)
}

/// POST /api/hosts — add or update a host
pub async fn put_host(state: web::Data<AppState>, body: web::Json<Host>) -> HttpResponse {
    let endpoint = body.endpoint.clone();
    if endpoint.trim().is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": "endpoint required" }));
    }
    let added = state.registry.upsert(body.into_inner());
    info!("Host {} {}", endpoint, if added { "registered" } else { "updated" });
    HttpResponse::Ok().json(serde_json::json!({ "endpoint": endpoint, "added": added }))
}

/// DELETE /api/hosts?host= — remove a host and its cache entry
pub async fn remove_host(state: web::Data<AppState>, query: web::Query<HostQuery>) -> HttpResponse {
    if state.registry.remove(&query.host) {
        state.cache.remove(&query.host);
        state.cache.adapters().panels.evict(&query.host);
        HttpResponse::Ok().json(serde_json::json!({ "removed": true }))
    } else {
        HttpResponse::NotFound().json(serde_json::json!({ "error": "Host not found" }))
    }
}

/// POST /api/hosts/refresh?host= — force a fresh read through the adapter
pub async fn refresh_host(state: web::Data<AppState>, query: web::Query<HostQuery>) -> HttpResponse {
    if state.registry.get(&query.host).is_none() {
        return HttpResponse::NotFound().json(serde_json::json!({ "error": "Host not found" }));
    }
    match state.cache.refresh(&query.host).await {
        Ok(nodes) => HttpResponse::Ok().json(nodes),
        Err(e) => HttpResponse::BadGateway().json(serde_json::json!({
            "error": e.to_string(),
            "kind": e.kind(),
        })),
    }
}

/// POST /api/hosts/provision?host= — install the heartbeat agent
pub async fn provision_host(state: web::Data<AppState>, query: web::Query<HostQuery>) -> HttpResponse {
    match state.provisioner.install_agent(&query.host).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "success": true })),
        Err(e) => HttpResponse::BadGateway().json(serde_json::json!({ "error": e })),
    }
}

/// POST /api/hosts/provision_all — bulk agent rollout
pub async fn provision_all(state: web::Data<AppState>) -> HttpResponse {
    let (ok, failed) = state.provisioner.install_all().await;
    HttpResponse::Ok().json(serde_json::json!({ "installed": ok, "failed": failed }))
}

// ─── Node mutation API ───
// Every mutation round-trips through the adapter, then the cache entry is
// replaced wholesale by a forced re-read — never patched in place.

#[derive(Deserialize)]
pub struct NodeTarget {
    pub host: String,
    pub id: i64,
}

enum NodeMutation {
    Add(NodeRecord),
    Update(i64, NodeRecord),
    Delete(i64),
}

async fn mutate_and_reread(state: &AppState, endpoint: &str, mutation: NodeMutation) -> HttpResponse {
    let Some(host) = state.registry.get(endpoint) else {
        return HttpResponse::NotFound().json(serde_json::json!({ "error": "Host not found" }));
    };
    let Some(backend) = state.cache.adapters().backend_for(&host) else {
        return HttpResponse::BadRequest()
            .json(serde_json::json!({ "error": "Host has no usable credentials" }));
    };

    let result = match &mutation {
        NodeMutation::Add(record) => backend.add_node(record).await,
        NodeMutation::Update(id, record) => backend.update_node(*id, record).await,
        NodeMutation::Delete(id) => backend.delete_node(*id).await,
    };

    if let Err(e) = result {
        state.registry.set_status(
            endpoint,
            match e {
                crate::adapter::AdapterError::Connect(_) | crate::adapter::AdapterError::Auth(_) => {
                    HostStatus::Error
                }
                _ => HostStatus::Offline,
            },
            Some(e.to_string()),
        );
        return HttpResponse::BadGateway().json(serde_json::json!({
            "error": e.to_string(),
            "kind": e.kind(),
        }));
    }

    match state.cache.refresh(endpoint).await {
        Ok(nodes) => HttpResponse::Ok().json(nodes),
        Err(e) => HttpResponse::BadGateway().json(serde_json::json!({
            "error": format!("mutation applied but re-read failed: {}", e),
            "kind": e.kind(),
        })),
    }
}

/// POST /api/nodes/add?host= — create a relay on a host
pub async fn add_node(
    state: web::Data<AppState>,
    query: web::Query<HostQuery>,
    body: web::Json<NodeRecord>,
) -> HttpResponse {
    mutate_and_reread(&state, &query.host, NodeMutation::Add(body.into_inner())).await
}

/// POST /api/nodes/update?host=&id= — replace a relay's configuration
pub async fn update_node(
    state: web::Data<AppState>,
    query: web::Query<NodeTarget>,
    body: web::Json<NodeRecord>,
) -> HttpResponse {
    mutate_and_reread(
        &state,
        &query.host,
        NodeMutation::Update(query.id, body.into_inner()),
    )
    .await
}

/// DELETE /api/nodes?host=&id= — delete a relay
pub async fn delete_node(state: web::Data<AppState>, query: web::Query<NodeTarget>) -> HttpResponse {
    mutate_and_reread(&state, &query.host, NodeMutation::Delete(query.id)).await
}

// ─── Summary & alerting config ───

/// GET /api/summary — fleet totals for the dashboard tiles
pub async fn summary(state: web::Data<AppState>) -> HttpResponse {
    let now = now_secs();
    let hosts = state.registry.list();

    let mut online = 0usize;
    let mut node_count = 0usize;
    let mut traffic_bytes: i64 = 0;

    for host in &hosts {
        let nodes = state.cache.peek(&host.endpoint).unwrap_or_default();
        let sample = state.heartbeats.get(&host.endpoint);

        // Heartbeat within the last minute or a good cached status counts
        let fresh_heartbeat = sample
            .as_ref()
            .is_some_and(|s| now.saturating_sub(s.received_at) < 60);
        if fresh_heartbeat || host.status == HostStatus::Online {
            online += 1;
        }

        // Prefer agent-reported totals; fall back to relay counters
        let reported = sample.as_ref().and_then(|s| {
            let get = |k: &str| s.metrics.get(k).and_then(|v| v.as_i64());
            match (get("net_total_in"), get("net_total_out")) {
                (Some(i), Some(o)) => Some(i + o),
                _ => None,
            }
        });
        traffic_bytes += reported
            .unwrap_or_else(|| nodes.iter().map(|n| n.up + n.down).sum());

        node_count += nodes.len();
    }

    HttpResponse::Ok().json(serde_json::json!({
        "hosts": hosts.len(),
        "online": online,
        "nodes": node_count,
        "traffic_bytes": traffic_bytes,
    }))
}

/// GET /api/alerts — alerting config with secrets masked
pub async fn get_alert_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(crate::alerting::AlertConfig::load(&state.data_dir).to_masked_json())
}

/// PUT /api/alerts — save alerting config
pub async fn save_alert_config(
    state: web::Data<AppState>,
    body: web::Json<crate::alerting::AlertConfig>,
) -> HttpResponse {
    match body.save(&state.data_dir) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "success": true })),
        Err(e) => HttpResponse::InternalServerError().json(serde_json::json!({ "error": e })),
    }
}

/// POST /api/alerts/test — fire a test notification on every channel
pub async fn test_alerts(state: web::Data<AppState>) -> HttpResponse {
    let config = crate::alerting::AlertConfig::load(&state.data_dir);
    let results: Vec<_> = crate::alerting::send_test(&config)
        .await
        .into_iter()
        .map(|(channel, result)| {
            serde_json::json!({
                "channel": channel,
                "ok": result.is_ok(),
                "error": result.err(),
            })
        })
        .collect();
    HttpResponse::Ok().json(results)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        // Agent-facing
        .route("/api/heartbeat", web::post().to(heartbeat))
        .route("/api/register", web::post().to(register))
        // Hosts
        .route("/api/hosts", web::get().to(get_hosts))
        .route("/api/hosts", web::post().to(put_host))
        .route("/api/hosts", web::delete().to(remove_host))
        .route("/api/hosts/refresh", web::post().to(refresh_host))
        .route("/api/hosts/provision", web::post().to(provision_host))
        .route("/api/hosts/provision_all", web::post().to(provision_all))
        // Nodes
        .route("/api/nodes", web::get().to(get_nodes))
        .route("/api/nodes", web::delete().to(delete_node))
        .route("/api/nodes/add", web::post().to(add_node))
        .route("/api/nodes/update", web::post().to(update_node))
        // Summary & alerting
        .route("/api/summary", web::get().to(summary))
        .route("/api/alerts", web::get().to(get_alert_config))
        .route("/api/alerts", web::put().to(save_alert_config))
        .route("/api/alerts/test", web::post().to(test_alerts));
}
