use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::core::error::QuotaError;

// --- Claude credentials ---

#[derive(Deserialize)]
struct ClaudeCredentialsFile {
    #[serde(rename = "claudeAiOauth")]
    claude_ai_oauth: Option<ClaudeOAuthEntry>,
}

#[derive(Deserialize)]
struct ClaudeOAuthEntry {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "subscriptionType")]
    subscription_type: Option<String>,
}

#[derive(Debug)]
pub struct ClaudeCredentials {
    pub access_token: String,
    pub subscription_type: Option<String>,
}

/// Read Claude OAuth credentials (normally ~/.claude/.credentials.json).
///
/// Never cached: the CLI rotates the token underneath us.
pub async fn read_claude_credentials(path: &Path) -> Result<ClaudeCredentials, QuotaError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Claude credentials not readable");
            return Err(QuotaError::not_logged_in());
        }
    };
    let file: ClaudeCredentialsFile = serde_json::from_str(&content).map_err(|e| {
        debug!(error = %e, "Failed to parse Claude credentials JSON");
        QuotaError::NotAuthenticated("Invalid credentials file".to_string())
    })?;
    let oauth = file
        .claude_ai_oauth
        .ok_or_else(|| QuotaError::NotAuthenticated("No access token".to_string()))?;
    match oauth.access_token {
        Some(token) if !token.is_empty() => Ok(ClaudeCredentials {
            access_token: token,
            subscription_type: oauth.subscription_type.filter(|s| !s.is_empty()),
        }),
        _ => Err(QuotaError::NotAuthenticated("No access token".to_string())),
    }
}

// --- Codex credentials ---

#[derive(Deserialize)]
struct CodexAuthFile {
    tokens: Option<CodexTokens>,
}

#[derive(Deserialize)]
struct CodexTokens {
    id_token: Option<String>,
}

/// Codex only needs the auth file to exist; the app-server and session
/// logs carry the actual data.
pub async fn codex_auth_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Account email from the `id_token` claims in the Codex auth file.
pub async fn read_codex_account(path: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let file: CodexAuthFile = serde_json::from_str(&content).ok()?;
    let id_token = file.tokens?.id_token?;
    match decode_jwt_claims(&id_token) {
        Ok(claims) => email_from_claims(&claims),
        Err(e) => {
            debug!(error = %e, "Could not decode Codex id_token");
            None
        }
    }
}

fn email_from_claims(claims: &serde_json::Value) -> Option<String> {
    claims
        .get("email")
        .or_else(|| claims.pointer("/https:~1~1api.openai.com~1profile/email"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Decode a JWT payload without signature verification.
/// Returns the decoded JSON claims as a serde_json::Value.
pub fn decode_jwt_claims(token: &str) -> Result<serde_json::Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        anyhow::bail!("Invalid JWT: expected 3 parts, got {}", parts.len());
    }
    let payload = parts[1].trim_end_matches('=');
    use base64::Engine;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .with_context(|| "Failed to base64url decode JWT payload")?;
    let claims: serde_json::Value =
        serde_json::from_slice(&decoded).with_context(|| "Failed to parse JWT payload as JSON")?;
    Ok(claims)
}
