use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::monitor::{AlertEvent, TransitionKind};

/// Alerting configuration — persisted to `<data_dir>/alerts.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub enabled: bool,

    // ── Notification channels ──
    #[serde(default)]
    pub discord_webhook: String,
    #[serde(default)]
    pub slack_webhook: String,
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            discord_webhook: String::new(),
            slack_webhook: String::new(),
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
        }
    }
}

impl AlertConfig {
    fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("alerts.json")
    }

    /// Load config from disk or return defaults
    pub fn load(data_dir: &Path) -> Self {
        crate::store::load_json_or_default(&Self::path(data_dir))
    }

    /// Save config to disk
    pub fn save(&self, data_dir: &Path) -> Result<(), String> {
        crate::store::save_json(&Self::path(data_dir), self)
    }

    /// Check if any notification channel is configured
    pub fn has_channels(&self) -> bool {
        !self.discord_webhook.is_empty()
            || !self.slack_webhook.is_empty()
            || (!self.telegram_bot_token.is_empty() && !self.telegram_chat_id.is_empty())
    }

    /// Return a JSON representation with secrets masked
    pub fn to_masked_json(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": self.enabled,
            "discord_webhook": mask_secret(&self.discord_webhook),
            "slack_webhook": mask_secret(&self.slack_webhook),
            "telegram_bot_token": mask_secret(&self.telegram_bot_token),
            "telegram_chat_id": self.telegram_chat_id,
            "has_discord": !self.discord_webhook.is_empty(),
            "has_slack": !self.slack_webhook.is_empty(),
            "has_telegram": !self.telegram_bot_token.is_empty() && !self.telegram_chat_id.is_empty(),
        })
    }
}

fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    if s.len() <= 8 {
        return "********".to_string();
    }
    format!("{}…{}", &s[..4], &s[s.len() - 4..])
}

/// Drain monitor transitions into outbound notifications.
///
/// The config is re-read per event so channel changes apply without a
/// restart; the monitor's hysteresis already debounces, so there is no
/// cooldown window here.
pub fn spawn_dispatcher(data_dir: PathBuf, mut events: mpsc::UnboundedReceiver<AlertEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let config = AlertConfig::load(&data_dir);
            let (title, body) = format_event(&event);
            info!("Dispatching alert: {}", title);
            send_alert(&config, &title, &body).await;
        }
    });
}

fn format_event(event: &AlertEvent) -> (String, String) {
    let time = event.at.format("%Y-%m-%d %H:%M:%S UTC");
    match event.kind {
        TransitionKind::Offline => (
            format!("🔴 [WolfRelay ALERT] {} has gone offline", event.name),
            format!(
                "Host: {}\nEndpoint: {}\nStatus: OFFLINE\nTime: {}\n\n\
                 No heartbeat has arrived for several evaluation windows.\n\
                 Please investigate.",
                event.name, event.endpoint, time
            ),
        ),
        TransitionKind::Recovered => (
            format!("🟢 [WolfRelay OK] {} is back online", event.name),
            format!(
                "Host: {}\nEndpoint: {}\nStatus: ONLINE\nTime: {}\n\n\
                 Heartbeats are arriving again.",
                event.name, event.endpoint, time
            ),
        ),
    }
}

// ═══════════════════════════════════════════════
// ─── Send notifications to configured channels ───
// ═══════════════════════════════════════════════

/// Send alert to all configured channels (best-effort)
pub async fn send_alert(config: &AlertConfig, title: &str, message: &str) {
    if !config.enabled || !config.has_channels() {
        return;
    }

    // Discord
    if !config.discord_webhook.is_empty() {
        if let Err(e) = send_discord(&config.discord_webhook, title, message).await {
            warn!("Discord alert failed: {}", e);
        }
    }

    // Slack
    if !config.slack_webhook.is_empty() {
        if let Err(e) = send_slack(&config.slack_webhook, title, message).await {
            warn!("Slack alert failed: {}", e);
        }
    }

    // Telegram
    if !config.telegram_bot_token.is_empty() && !config.telegram_chat_id.is_empty() {
        if let Err(e) = send_telegram(&config.telegram_bot_token, &config.telegram_chat_id, title, message).await {
            warn!("Telegram alert failed: {}", e);
        }
    }
}

/// Send a test notification to all configured channels
pub async fn send_test(config: &AlertConfig) -> Vec<(String, Result<(), String>)> {
    let mut results = Vec::new();
    let title = "🧪 WolfRelay Test Alert";
    let message = "This is a test notification from WolfRelay. If you received this, your alerting is configured correctly!";

    if !config.discord_webhook.is_empty() {
        let r = send_discord(&config.discord_webhook, title, message).await;
        results.push(("discord".to_string(), r));
    }
    if !config.slack_webhook.is_empty() {
        let r = send_slack(&config.slack_webhook, title, message).await;
        results.push(("slack".to_string(), r));
    }
    if !config.telegram_bot_token.is_empty() && !config.telegram_chat_id.is_empty() {
        let r = send_telegram(&config.telegram_bot_token, &config.telegram_chat_id, title, message).await;
        results.push(("telegram".to_string(), r));
    }

    results
}

// ── Discord webhook ──
async fn send_discord(webhook_url: &str, title: &str, message: &str) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| e.to_string())?;

    let payload = serde_json::json!({
        "embeds": [{
            "title": title,
            "description": message,
            "color": if title.contains("ALERT") { 16711680 } else { 65280 },
            "footer": { "text": "WolfRelay Alerting" },
            "timestamp": chrono::Utc::now().to_rfc3339()
        }]
    });

    let resp = client.post(webhook_url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if resp.status().is_success() || resp.status().as_u16() == 204 {
        info!("Discord alert sent: {}", title);
        Ok(())
    } else {
        Err(format!("Discord HTTP {}", resp.status()))
    }
}

// ── Slack webhook ──
async fn send_slack(webhook_url: &str, title: &str, message: &str) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| e.to_string())?;

    let payload = serde_json::json!({
        "blocks": [
            { "type": "header", "text": { "type": "plain_text", "text": title } },
            { "type": "section", "text": { "type": "mrkdwn", "text": message } },
            { "type": "context", "elements": [{ "type": "mrkdwn", "text": format!("_WolfRelay Alerting — {}_", chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")) }] }
        ]
    });

    let resp = client.post(webhook_url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if resp.status().is_success() {
        info!("Slack alert sent: {}", title);
        Ok(())
    } else {
        Err(format!("Slack HTTP {}", resp.status()))
    }
}

// ── Telegram bot ──
async fn send_telegram(bot_token: &str, chat_id: &str, title: &str, message: &str) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| e.to_string())?;

    let url = format!("https://api.telegram.org/bot{}/sendMessage", bot_token);
    let text = format!("*{}*\n\n{}", title, message);

    let payload = serde_json::json!({
        "chat_id": chat_id,
        "text": text,
        "parse_mode": "Markdown",
        "disable_web_page_preview": true
    });

    let resp = client.post(&url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if resp.status().is_success() {
        info!("Telegram alert sent: {}", title);
        Ok(())
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(format!("Telegram error: {}", body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_json_never_leaks_tokens() {
        let config = AlertConfig {
            enabled: true,
            telegram_bot_token: "123456789:AAbbCCddEEffGG".to_string(),
            telegram_chat_id: "-100200300".to_string(),
            ..Default::default()
        };
        let masked = config.to_masked_json();
        let rendered = masked.to_string();
        assert!(!rendered.contains("AAbbCCddEEffGG"));
        assert_eq!(masked["has_telegram"], true);
        assert_eq!(masked["has_discord"], false);
    }

    #[test]
    fn offline_and_recovered_messages_name_the_host() {
        let event = AlertEvent {
            endpoint: "10.0.0.1:8080".into(),
            name: "🇩🇪 Frankfurt".into(),
            kind: TransitionKind::Offline,
            at: chrono::Utc::now(),
        };
        let (title, body) = format_event(&event);
        assert!(title.contains("gone offline"));
        assert!(body.contains("10.0.0.1:8080"));

        let recovered = AlertEvent {
            kind: TransitionKind::Recovered,
            ..event
        };
        let (title, _) = format_event(&recovered);
        assert!(title.contains("back online"));
    }

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = AlertConfig {
            enabled: true,
            slack_webhook: "https://hooks.slack.example/T000".to_string(),
            ..Default::default()
        };
        config.save(dir.path()).unwrap();
        let loaded = AlertConfig::load(dir.path());
        assert!(loaded.enabled);
        assert_eq!(loaded.slack_webhook, config.slack_webhook);
    }
}
