use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::{LabeledQuota, QuotaReport, ReportSource};
use crate::core::error::QuotaError;
use crate::core::models::usage::QuotaWindow;
use crate::core::process::{run_command, CommandError};

static CLAUDE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)claude").expect("Invalid regex"));

/// `antigravity-usage quota --json` prints one account or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CliOutput {
    Many(Vec<CliAccount>),
    One(Box<CliAccount>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliAccount {
    email: Option<String>,
    account_email: Option<String>,
    models: Option<Vec<CliModel>>,
    snapshot: Option<CliSnapshot>,
}

#[derive(Debug, Deserialize)]
struct CliSnapshot {
    models: Option<Vec<CliModel>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliModel {
    label: Option<String>,
    remaining_percentage: Option<f64>,
    reset_time: Option<String>,
}

/// Ask the companion CLI for quota data.
pub async fn read_quota(binary: &str, timeout: Duration) -> Result<QuotaReport, QuotaError> {
    let stdout = run_command(binary, &["quota", "--json"], timeout)
        .await
        .map_err(|e| {
            debug!(error = %e, "Antigravity CLI fallback failed");
            match e {
                CommandError::Failed { .. } => QuotaError::Upstream("Failed to get quota from LSP".to_string()),
                CommandError::Timeout(_) => QuotaError::Timeout("Failed to get quota".to_string()),
                _ => QuotaError::Unknown("Failed to get quota".to_string()),
            }
        })?;
    parse_output(&stdout)
}

fn parse_output(stdout: &str) -> Result<QuotaReport, QuotaError> {
    let output: Option<CliOutput> = serde_json::from_str(stdout).map_err(|e| {
        debug!(error = %e, "Unreadable Antigravity CLI output");
        QuotaError::Unknown("Failed to get quota".to_string())
    })?;
    let account = match output {
        Some(CliOutput::Many(accounts)) => accounts.into_iter().next(),
        Some(CliOutput::One(account)) => Some(*account),
        None => None,
    }
    .ok_or_else(no_account_data)?;

    let raw_models = account
        .models
        .or_else(|| account.snapshot.and_then(|s| s.models))
        .unwrap_or_default();

    let mut models: Vec<LabeledQuota> = Vec::new();
    for model in raw_models {
        let (Some(label), Some(remaining)) = (model.label, model.remaining_percentage) else {
            continue;
        };
        let resets_at = model
            .reset_time
            .as_deref()
            .and_then(|t| t.parse::<DateTime<Utc>>().ok());
        models.push(LabeledQuota {
            label,
            window: normalize_remaining(remaining, resets_at),
        });
    }
    if models.is_empty() {
        return Err(no_account_data());
    }

    let primary = models
        .iter()
        .find(|m| CLAUDE_RE.is_match(&m.label))
        .or_else(|| models.first())
        .map(|m| m.label.clone());

    Ok(QuotaReport {
        account: account
            .email
            .or(account.account_email)
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
        primary,
        models,
        source: ReportSource::Cli,
        port: None,
    })
}

fn no_account_data() -> QuotaError {
    QuotaError::NoData("No account data".to_string())
}

/// Values at or below 1 are read as a fraction, anything above as percent.
fn normalize_remaining(value: f64, resets_at: Option<DateTime<Utc>>) -> QuotaWindow {
    if value <= 1.0 {
        QuotaWindow::from_remaining_fraction(value, resets_at)
    } else {
        QuotaWindow::from_remaining_percent(value, resets_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn array_output_uses_first_account() {
        let json = r#"[
            { "email": "first@example.com", "models": [
                { "label": "Gemini 3 Pro", "remainingPercentage": 0.8 },
                { "label": "Claude Sonnet 4.5", "remainingPercentage": 35, "resetTime": "2025-12-01T08:00:00Z" }
            ] },
            { "email": "second@example.com", "models": [] }
        ]"#;
        let report = parse_output(json).unwrap();
        assert_eq!(report.account, "first@example.com");
        assert_eq!(report.source, ReportSource::Cli);
        assert_eq!(report.models[0].window.remaining, 80);
        assert_eq!(report.models[1].window.remaining, 35);
        assert!(report.models[1].window.resets_at.is_some());
        assert_eq!(report.primary.as_deref(), Some("Claude Sonnet 4.5"));
    }

    #[test]
    fn object_output_with_snapshot_models() {
        let json = r#"{ "accountEmail": "acct@example.com", "snapshot": { "models": [
            { "label": "Gemini 3 Flash", "remainingPercentage": 1 },
            { "label": "no quota" },
            { "remainingPercentage": 0.5 }
        ] } }"#;
        let report = parse_output(json).unwrap();
        assert_eq!(report.account, "acct@example.com");
        assert_eq!(report.models.len(), 1);
        // 1 sits on the fraction side of the heuristic
        assert_eq!(report.models[0].window.remaining, 100);
        assert_eq!(report.primary.as_deref(), Some("Gemini 3 Flash"));
    }

    #[test]
    fn account_defaults_to_unknown() {
        let report = parse_output(r#"{ "models": [{ "label": "Gemini 3 Flash", "remainingPercentage": 0.5 }] }"#).unwrap();
        assert_eq!(report.account, "unknown");
        assert_eq!(report.primary.as_deref(), Some("Gemini 3 Flash"));
        assert_eq!(report.models[0].window.remaining, 50);
    }

    #[test]
    fn empty_array_is_no_account_data() {
        let err = parse_output("[]").unwrap_err();
        assert_eq!(err.to_string(), "No account data");
        assert_eq!(err.kind(), ErrorKind::NoData);
    }

    #[test]
    fn null_output_is_no_account_data() {
        let err = parse_output("null").unwrap_err();
        assert_eq!(err.to_string(), "No account data");
        assert_eq!(err.kind(), ErrorKind::NoData);
    }

    #[test]
    fn account_without_usable_models_is_no_account_data() {
        for json in [
            r#"{ "email": "a@example.com" }"#,
            r#"{ "email": "a@example.com", "models": [] }"#,
            r#"[{ "email": "a@example.com", "snapshot": { "models": [{ "label": "no quota" }] } }]"#,
        ] {
            let err = parse_output(json).unwrap_err();
            assert_eq!(err.to_string(), "No account data", "{}", json);
            assert_eq!(err.kind(), ErrorKind::NoData);
        }
    }

    #[test]
    fn garbage_output_fails() {
        assert_eq!(parse_output("not json").unwrap_err().to_string(), "Failed to get quota");
    }

    #[tokio::test]
    async fn non_zero_exit_is_lsp_failure() {
        let err = read_quota("false", Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to get quota from LSP");
    }

    #[tokio::test]
    async fn missing_binary_fails() {
        let err = read_quota("qbar-no-such-cli", Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to get quota");
    }
}
