// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! HTTP panel backend — talks to a relay's web management surface
//!
//! Panels are deployed behind an unpredictable mix of schemes and path
//! prefixes, so the login endpoint is discovered: a fixed ordered list of
//! conventional paths (optionally preceded by an operator-supplied prefix)
//! is tried across http/https variants of the endpoint. The first
//! combination that authenticates is cached; every other management path
//! is derived from it by suffix substitution, never by a second discovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::{AdapterError, NodeRecord};
use crate::hosts::Host;

/// A discovered, working way into one panel
#[derive(Debug, Clone)]
struct Session {
    base_url: String,
    login_path: String,
}

/// Client for one host's panel. Holds the cookie jar and the cached
/// login discovery result; safe to share across callers.
pub struct PanelClient {
    endpoint: String,
    username: String,
    password: String,
    path_prefix: Option<String>,
    client: reqwest::Client,
    session: AsyncMutex<Option<Session>>,
}

impl PanelClient {
    pub fn new(
        endpoint: &str,
        username: &str,
        password: &str,
        path_prefix: Option<String>,
        timeout_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .danger_accept_invalid_certs(true) // panels ship self-signed certs
            .redirect(reqwest::redirect::Policy::none())
            .cookie_store(true)
            .user_agent("Mozilla/5.0")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            endpoint: endpoint.trim().trim_end_matches('/').to_string(),
            username: username.trim().to_string(),
            password: password.trim().to_string(),
            path_prefix,
            client,
            session: AsyncMutex::new(None),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Scheme variants to probe, in order. An endpoint without a scheme
    /// tries http then https; one with a scheme also tries the other.
    fn base_urls(&self) -> Vec<String> {
        let ep = self.endpoint.as_str();
        if let Some(rest) = ep.strip_prefix("http://") {
            vec![ep.to_string(), format!("https://{}", rest)]
        } else if let Some(rest) = ep.strip_prefix("https://") {
            vec![ep.to_string(), format!("http://{}", rest)]
        } else {
            vec![format!("http://{}", ep), format!("https://{}", ep)]
        }
    }

    fn candidate_paths(&self) -> Vec<String> {
        let mut paths = vec![
            "/login".to_string(),
            "/xui/login".to_string(),
            "/panel/login".to_string(),
        ];
        if let Some(prefix) = self.path_prefix.as_deref() {
            let p = prefix.trim_matches('/');
            if !p.is_empty() {
                paths.insert(0, format!("/{}/login", p));
            }
        }
        paths
    }

    /// POST with one retry on transport error
    async fn post_form(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<reqwest::Response, String> {
        let mut last_err = String::new();
        for attempt in 0..2 {
            match self.client.post(url).form(form).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    last_err = e.to_string();
                    if attempt == 0 {
                        continue;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Ok(true) — authenticated; Ok(false) — panel answered but said no;
    /// Err — transport never got an answer.
    async fn try_login_at(&self, base_url: &str, path: &str) -> Result<bool, String> {
        let form = [
            ("username", self.username.clone()),
            ("password", self.password.clone()),
        ];
        let resp = self.post_form(&format!("{}{}", base_url, path), &form).await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Ok(false);
        }
        match resp.json::<serde_json::Value>().await {
            Ok(body) => Ok(body.get("success").and_then(|v| v.as_bool()) == Some(true)),
            Err(_) => Ok(false),
        }
    }

    /// Authenticate, reusing the cached discovery result when possible.
    async fn ensure_session(&self) -> Result<Session, AdapterError> {
        let mut cached = self.session.lock().await;

        if let Some(session) = cached.as_ref() {
            match self.try_login_at(&session.base_url, &session.login_path).await {
                Ok(true) => return Ok(session.clone()),
                _ => {
                    debug!("Cached login path {} no longer works for {}", session.login_path, self.endpoint);
                    *cached = None;
                }
            }
        }

        let mut saw_response = false;
        let mut last_transport_err = String::from("no address variants to try");
        for base_url in self.base_urls() {
            for path in self.candidate_paths() {
                match self.try_login_at(&base_url, &path).await {
                    Ok(true) => {
                        debug!("Panel login for {} via {}{}", self.endpoint, base_url, path);
                        let session = Session {
                            base_url,
                            login_path: path,
                        };
                        *cached = Some(session.clone());
                        return Ok(session);
                    }
                    Ok(false) => saw_response = true,
                    Err(e) => last_transport_err = e,
                }
            }
        }

        if saw_response {
            Err(AdapterError::Auth(format!(
                "panel at {} rejected credentials on every login path",
                self.endpoint
            )))
        } else {
            Err(AdapterError::Connect(last_transport_err))
        }
    }

    async fn invalidate(&self) {
        *self.session.lock().await = None;
    }

    /// POST to a path derived from the login path, expect the usual
    /// `{success, msg, obj}` envelope, and return `obj`.
    async fn call(
        &self,
        session: &Session,
        derived_path: &str,
        form: &[(&str, String)],
    ) -> Result<serde_json::Value, AdapterError> {
        let url = format!("{}{}", session.base_url, derived_path);
        let resp = self
            .post_form(&url, form)
            .await
            .map_err(AdapterError::Connect)?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(AdapterError::Rejected(format!(
                "HTTP {} from {}",
                resp.status(),
                derived_path
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::Decode(e.to_string()))?;

        if body.get("success").and_then(|v| v.as_bool()) != Some(true) {
            let msg = body
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("operation refused")
                .to_string();
            return Err(AdapterError::Rejected(msg));
        }

        Ok(body.get("obj").cloned().unwrap_or(serde_json::Value::Null))
    }

    fn record_form(record: &NodeRecord) -> Vec<(&'static str, String)> {
        vec![
            ("remark", record.remark.clone()),
            ("enable", record.enable.to_string()),
            ("protocol", record.protocol.clone()),
            ("port", record.port.to_string()),
            ("listen", String::new()),
            ("settings", record.settings.clone()),
            ("streamSettings", record.stream_settings.clone()),
            ("sniffing", record.sniffing.clone()),
            ("up", record.up.to_string()),
            ("down", record.down.to_string()),
            ("total", record.total.to_string()),
            ("expiryTime", record.expiry_time.to_string()),
        ]
    }

    /// One shot of an operation against an established session
    async fn dispatch(&self, session: &Session, op: &PanelOp<'_>) -> Result<serde_json::Value, AdapterError> {
        match *op {
            PanelOp::List => {
                let path = session.login_path.replace("login", "inbound/list");
                self.call(session, &path, &[]).await
            }
            PanelOp::Add(record) => {
                let path = session.login_path.replace("login", "inbound/add");
                self.call(session, &path, &Self::record_form(record)).await
            }
            PanelOp::Update(id, record) => {
                let path = session
                    .login_path
                    .replace("login", &format!("inbound/update/{}", id));
                self.call(session, &path, &Self::record_form(record)).await
            }
            PanelOp::Delete(id) => {
                let path = session
                    .login_path
                    .replace("login", &format!("inbound/del/{}", id));
                self.call(session, &path, &[]).await
            }
        }
    }

    /// Run an operation; on failure past an established session, drop the
    /// cached discovery and run it once more before surfacing the error.
    async fn run_op(&self, op: PanelOp<'_>) -> Result<serde_json::Value, AdapterError> {
        let session = self.ensure_session().await?;
        match self.dispatch(&session, &op).await {
            Ok(value) => Ok(value),
            Err(AdapterError::Connect(e)) => Err(AdapterError::Connect(e)),
            Err(first) => {
                debug!("Panel op failed on {} ({}), rediscovering once", self.endpoint, first);
                self.invalidate().await;
                let session = self.ensure_session().await?;
                self.dispatch(&session, &op).await
            }
        }
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>, AdapterError> {
        let obj = self.run_op(PanelOp::List).await?;
        serde_json::from_value(obj).map_err(|e| AdapterError::Decode(e.to_string()))
    }

    pub async fn add_node(&self, record: &NodeRecord) -> Result<(), AdapterError> {
        self.run_op(PanelOp::Add(record)).await.map(|_| ())
    }

    pub async fn update_node(&self, id: i64, record: &NodeRecord) -> Result<(), AdapterError> {
        self.run_op(PanelOp::Update(id, record)).await.map(|_| ())
    }

    pub async fn delete_node(&self, id: i64) -> Result<(), AdapterError> {
        self.run_op(PanelOp::Delete(id)).await.map(|_| ())
    }
}

/// The four management operations a panel understands
enum PanelOp<'a> {
    List,
    Add(&'a NodeRecord),
    Update(i64, &'a NodeRecord),
    Delete(i64),
}

/// One PanelClient per endpoint, kept so the session survives between
/// calls. A client is rebuilt when the stored credentials change.
pub struct PanelPool {
    clients: Mutex<HashMap<String, Arc<PanelClient>>>,
    timeout_secs: u64,
}

impl PanelPool {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            timeout_secs,
        }
    }

    pub fn client_for(&self, host: &Host) -> Arc<PanelClient> {
        let user = host.panel_user.clone().unwrap_or_default();
        let pass = host.panel_pass.clone().unwrap_or_default();

        let mut clients = self.clients.lock().unwrap();
        if let Some(existing) = clients.get(&host.endpoint) {
            if existing.username() == user.trim() {
                return existing.clone();
            }
        }
        let client = Arc::new(PanelClient::new(
            &host.endpoint,
            &user,
            &pass,
            host.panel_path_prefix.clone(),
            self.timeout_secs,
        ));
        clients.insert(host.endpoint.clone(), client.clone());
        client
    }

    /// Drop the cached client (and its session) for an endpoint
    pub fn evict(&self, endpoint: &str) {
        self.clients.lock().unwrap().remove(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_login() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true}))
    }

    async fn panel_with_third_candidate(server: &MockServer) -> PanelClient {
        // /login and /xui/login fall through to wiremock's default 404;
        // the 3rd candidate is the one that works.
        Mock::given(method("POST"))
            .and(path("/panel/login"))
            .respond_with(ok_login())
            .mount(server)
            .await;

        let endpoint = server.uri().trim_start_matches("http://").to_string();
        PanelClient::new(&endpoint, "admin", "secret", None, 5)
    }

    #[tokio::test]
    async fn login_discovery_finds_third_candidate_and_caches_it() {
        let server = MockServer::start().await;
        let panel = panel_with_third_candidate(&server).await;

        Mock::given(method("POST"))
            .and(path("/panel/inbound/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "obj": [{"id": 1, "remark": "edge", "enable": true, "protocol": "vmess",
                         "port": 443, "settings": "{}", "streamSettings": "{}",
                         "up": 5, "down": 9, "total": 0, "expiryTime": 0}]
            })))
            .mount(&server)
            .await;

        let nodes = panel.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].remark, "edge");
        assert_eq!(nodes[0].down, 9);

        let early_candidates_before: usize = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/login" || r.url.path() == "/xui/login")
            .count();
        assert!(early_candidates_before >= 2, "discovery probed earlier candidates once");

        // Second call must go straight to the cached path.
        panel.list_nodes().await.unwrap();
        let early_candidates_after: usize = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/login" || r.url.path() == "/xui/login")
            .count();
        assert_eq!(
            early_candidates_before, early_candidates_after,
            "cached login path must skip candidates 1-2"
        );
    }

    #[tokio::test]
    async fn prefix_candidate_is_tried_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ops/login"))
            .respond_with(ok_login())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ops/inbound/list"))
            .respond_with(ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"success": true, "obj": []})))
            .mount(&server)
            .await;

        let endpoint = server.uri().trim_start_matches("http://").to_string();
        let panel = PanelClient::new(&endpoint, "admin", "secret", Some("ops".into()), 5);
        assert!(panel.list_nodes().await.unwrap().is_empty());

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests[0].url.path(), "/ops/login");
    }

    #[tokio::test]
    async fn rejected_operation_surfaces_remote_message() {
        let server = MockServer::start().await;
        let panel = panel_with_third_candidate(&server).await;

        Mock::given(method("POST"))
            .and(path("/panel/inbound/del/7"))
            .respond_with(ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"success": false, "msg": "record in use"})))
            .mount(&server)
            .await;

        match panel.delete_node(7).await {
            Err(AdapterError::Rejected(msg)) => assert!(msg.contains("record in use")),
            other => panic!("expected Rejected, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn add_posts_record_fields_as_form() {
        let server = MockServer::start().await;
        let panel = panel_with_third_candidate(&server).await;

        Mock::given(method("POST"))
            .and(path("/panel/inbound/add"))
            .and(body_string_contains("remark=edge-fra"))
            .and(body_string_contains("protocol=vless"))
            .respond_with(ok_login())
            .expect(1)
            .mount(&server)
            .await;

        let record = NodeRecord {
            remark: "edge-fra".into(),
            protocol: "vless".into(),
            port: 443,
            ..Default::default()
        };
        panel.add_node(&record).await.unwrap();
    }

    #[tokio::test]
    async fn credentials_rejected_everywhere_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"success": false})))
            .mount(&server)
            .await;

        let endpoint = server.uri().trim_start_matches("http://").to_string();
        let panel = PanelClient::new(&endpoint, "admin", "wrong", None, 5);
        match panel.list_nodes().await {
            Err(AdapterError::Auth(_)) => {}
            other => panic!("expected Auth, got {:?}", other.map(|_| ())),
        }
    }
}
