use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::{LabeledQuota, QuotaReport, ReportSource};
use crate::core::models::usage::QuotaWindow;

const USER_STATUS_PATH: &str = "/exa.language_server_pb.LanguageServerService/GetUserStatus";

/// Tracked models in primary-window priority order.
static MODEL_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("Claude Opus", r"(?i)claude.*opus.*thinking"),
        ("Gemini Pro", r"(?i)gemini.*3.*pro.*high"),
        ("Gemini Flash", r"(?i)gemini.*3.*flash"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("Invalid regex")))
    .collect()
});

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetUserStatusResponse {
    user_status: Option<UserStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserStatus {
    name: Option<String>,
    email: Option<String>,
    cascade_model_config_data: Option<CascadeModelConfigData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CascadeModelConfigData {
    #[serde(default)]
    client_model_configs: Vec<ClientModelConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientModelConfig {
    #[serde(default)]
    label: String,
    quota_info: Option<QuotaInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotaInfo {
    remaining_fraction: Option<f64>,
    reset_time: Option<String>,
}

/// POST `GetUserStatus` to each port in turn; the first usable answer wins.
pub async fn probe_ports(
    scheme: &str,
    csrf_token: &str,
    ports: &[u16],
    per_attempt: Duration,
) -> Option<QuotaReport> {
    // Self-signed certificate on localhost
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(per_attempt)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "Failed to build HTTP client");
            return None;
        }
    };

    for &port in ports {
        match probe_port(&client, scheme, csrf_token, port).await {
            Ok(report) => return Some(report),
            Err(reason) => debug!(port, %reason, "Language server port rejected"),
        }
    }
    None
}

async fn probe_port(
    client: &reqwest::Client,
    scheme: &str,
    csrf_token: &str,
    port: u16,
) -> Result<QuotaReport, String> {
    let url = format!("{}://127.0.0.1:{}{}", scheme, port, USER_STATUS_PATH);
    let response = client
        .post(&url)
        .header("X-Codeium-Csrf-Token", csrf_token)
        .header("Connect-Protocol-Version", "1")
        .json(&serde_json::json!({ "metadata": { "ideName": "antigravity" } }))
        .send()
        .await
        .map_err(|e| if e.is_timeout() { "timeout".to_string() } else { e.to_string() })?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP {}", status.as_u16()));
    }
    let data: GetUserStatusResponse = response.json().await.map_err(|e| e.to_string())?;
    let mut report = parse_user_status(data).ok_or_else(|| "no identity or model quotas in response".to_string())?;
    report.port = Some(port);
    Ok(report)
}

fn parse_user_status(data: GetUserStatusResponse) -> Option<QuotaReport> {
    let status = data.user_status?;
    let email = status.email.filter(|e| !e.is_empty())?;
    let account = status
        .name
        .as_deref()
        .and_then(|n| n.split_whitespace().next())
        .map(str::to_string)
        .unwrap_or(email);

    let configs = status
        .cascade_model_config_data
        .map(|d| d.client_model_configs)
        .unwrap_or_default();

    let models: Vec<LabeledQuota> = MODEL_PATTERNS
        .iter()
        .filter_map(|(name, pattern)| {
            let config = configs.iter().find(|c| pattern.is_match(&c.label))?;
            let info = config.quota_info.as_ref()?;
            let resets_at = info
                .reset_time
                .as_deref()
                .and_then(|t| t.parse::<DateTime<Utc>>().ok());
            Some(LabeledQuota {
                label: name.to_string(),
                window: QuotaWindow::from_remaining_fraction(info.remaining_fraction.unwrap_or(1.0), resets_at),
            })
        })
        .collect();
    if models.is_empty() {
        return None;
    }

    Some(QuotaReport {
        account,
        primary: models.first().map(|m| m.label.clone()),
        models,
        source: ReportSource::LanguageServer,
        port: None,
    })
}
