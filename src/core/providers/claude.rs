use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::auth::{read_claude_credentials, ClaudeCredentials};
use crate::core::cache::scoped_key;
use crate::core::context::Context;
use crate::core::error::QuotaError;
use crate::core::models::credits::ExtraUsage;
use crate::core::models::usage::{ProviderQuota, QuotaWindow};
use crate::core::providers::{ProviderId, QuotaProvider};

/// Prefix; entries are scoped to the access token they were fetched with.
const CACHE_KEY: &str = "claude-usage";
const BETA_HEADER: &str = "oauth-2025-04-20";
const FIVE_HOURS_MINUTES: u64 = 300;
const SEVEN_DAYS_MINUTES: u64 = 10080;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClaudeWindowRaw {
    utilization: Option<f64>,
    resets_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClaudeExtraUsageRaw {
    is_enabled: Option<bool>,
    monthly_limit: Option<f64>,
    used_credits: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClaudeUsageResponse {
    five_hour: Option<ClaudeWindowRaw>,
    seven_day: Option<ClaudeWindowRaw>,
    seven_day_sonnet: Option<ClaudeWindowRaw>,
    seven_day_opus: Option<ClaudeWindowRaw>,
    email: Option<String>,
    extra_usage: Option<ClaudeExtraUsageRaw>,
}

/// Subscription usage from the Anthropic OAuth usage endpoint.
pub struct ClaudeProvider {
    ctx: Arc<Context>,
}

impl ClaudeProvider {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn usage(&self, creds: &ClaudeCredentials) -> Result<ClaudeUsageResponse, QuotaError> {
        let key = scoped_key(CACHE_KEY, &creds.access_token);
        if let Some(cached) = self.ctx.cache.get::<ClaudeUsageResponse>(&key).await {
            return Ok(cached);
        }
        let usage = fetch_usage(&self.ctx, &creds.access_token).await?;
        self.ctx.cache.set(&key, &usage, self.ctx.ttls.default).await;
        Ok(usage)
    }
}

#[async_trait]
impl QuotaProvider for ClaudeProvider {
    fn id(&self) -> &str {
        ProviderId::Claude.id()
    }

    fn display_name(&self) -> &str {
        ProviderId::Claude.display_name()
    }

    fn cache_keys(&self) -> &'static [&'static str] {
        &[CACHE_KEY]
    }

    async fn is_available(&self) -> bool {
        read_claude_credentials(&self.ctx.claude.credentials_path)
            .await
            .is_ok()
    }

    async fn get_quota(&self) -> ProviderQuota {
        let creds = match read_claude_credentials(&self.ctx.claude.credentials_path).await {
            Ok(c) => c,
            Err(e) => return ProviderQuota::failed(self.id(), self.display_name(), &e),
        };
        let plan = Some(
            creds
                .subscription_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        );

        match self.usage(&creds).await {
            Ok(usage) => build_quota(usage).with_plan(plan),
            Err(e) => ProviderQuota::failed(self.id(), self.display_name(), &e).with_plan(plan),
        }
    }
}

async fn fetch_usage(ctx: &Context, access_token: &str) -> Result<ClaudeUsageResponse, QuotaError> {
    let client = reqwest::Client::builder()
        .timeout(ctx.timeouts.http)
        .build()
        .map_err(|e| {
            warn!(error = %e, "Failed to build HTTP client");
            QuotaError::Unknown("Failed to fetch usage".to_string())
        })?;

    let response = client
        .get(&ctx.claude.usage_url)
        .header("Authorization", format!("Bearer {}", access_token))
        .header("Accept", "application/json")
        .header("anthropic-beta", BETA_HEADER)
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;

    if is_token_expired(&body) {
        return Err(QuotaError::NotAuthenticated(
            "Token expired - please login again".to_string(),
        ));
    }
    if !status.is_success() {
        warn!(status = status.as_u16(), "Claude API error");
        return Err(QuotaError::Upstream(format!("API error: {}", status.as_u16())));
    }

    serde_json::from_str(&body).map_err(|e| {
        warn!(error = %e, "Failed to parse Claude usage response");
        QuotaError::Upstream("Invalid usage response".to_string())
    })
}

fn transport_error(e: reqwest::Error) -> QuotaError {
    if e.is_timeout() {
        warn!("Claude API timeout");
        QuotaError::request_timeout()
    } else {
        debug!(error = %e, "Claude API fetch error");
        QuotaError::Unknown("Failed to fetch usage".to_string())
    }
}

/// The API reports expiry as `{"error": {"error_code": "token_expired"}}`,
/// sometimes nested under `details`.
fn is_token_expired(body: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    let Some(error) = value.get("error") else {
        return false;
    };
    let expired = [error.get("error_code"), error.pointer("/details/error_code")]
        .into_iter()
        .flatten()
        .any(|code| code.as_str() == Some("token_expired"));
    expired
}

fn parse_window(raw: &ClaudeWindowRaw, window_minutes: u64) -> Option<QuotaWindow> {
    let used = raw.utilization?;
    let resets_at = raw
        .resets_at
        .as_deref()
        .and_then(|s| s.parse::<DateTime<Utc>>().ok());
    Some(QuotaWindow::from_used_percent(used, resets_at).with_window_minutes(Some(window_minutes)))
}

fn parse_extra_usage(raw: &ClaudeExtraUsageRaw) -> Option<ExtraUsage> {
    if raw.is_enabled != Some(true) {
        return None;
    }
    // Already in cents
    let used = raw.used_credits.unwrap_or(0.0).round() as i64;
    let limit = raw.monthly_limit.unwrap_or(0.0).round() as i64;
    Some(ExtraUsage::from_limit(limit, used))
}

fn build_quota(usage: ClaudeUsageResponse) -> ProviderQuota {
    let mut quota = ProviderQuota::available(
        ProviderId::Claude.id(),
        ProviderId::Claude.display_name(),
    );
    quota.account = usage.email.filter(|e| !e.is_empty());
    quota.primary = usage
        .five_hour
        .as_ref()
        .and_then(|w| parse_window(w, FIVE_HOURS_MINUTES));
    quota.secondary = usage
        .seven_day
        .as_ref()
        .and_then(|w| parse_window(w, SEVEN_DAYS_MINUTES));

    let weekly: BTreeMap<String, QuotaWindow> = [
        ("Sonnet", usage.seven_day_sonnet.as_ref()),
        ("Opus", usage.seven_day_opus.as_ref()),
    ]
    .into_iter()
    .filter_map(|(name, raw)| Some((name.to_string(), parse_window(raw?, SEVEN_DAYS_MINUTES)?)))
    .collect();
    if !weekly.is_empty() {
        quota.weekly_models = Some(weekly);
    }

    quota.extra_usage = usage.extra_usage.as_ref().and_then(parse_extra_usage);
    quota
}
