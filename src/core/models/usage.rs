use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{ErrorKind, QuotaError};
use crate::core::models::credits::ExtraUsage;

/// One consumption window, expressed as percent *remaining*.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaWindow {
    /// Percentage of the allowance still available (0 - 100)
    pub remaining: u8,
    /// When the window resets, if known
    pub resets_at: Option<DateTime<Utc>>,
    /// Window length in minutes, if the backend reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_minutes: Option<u64>,
}

impl QuotaWindow {
    /// Build from a "percent used" figure: `remaining = 100 - round(used)`.
    pub fn from_used_percent(used_percent: f64, resets_at: Option<DateTime<Utc>>) -> Self {
        Self {
            remaining: clamp_percent(100.0 - used_percent.round()),
            resets_at,
            window_minutes: None,
        }
    }

    /// Build from a remaining fraction in 0.0 - 1.0, truncating toward zero.
    pub fn from_remaining_fraction(fraction: f64, resets_at: Option<DateTime<Utc>>) -> Self {
        Self {
            remaining: clamp_percent((fraction * 100.0).floor()),
            resets_at,
            window_minutes: None,
        }
    }

    /// Build from an already-scaled remaining percentage.
    pub fn from_remaining_percent(percent: f64, resets_at: Option<DateTime<Utc>>) -> Self {
        Self {
            remaining: clamp_percent(percent.round()),
            resets_at,
            window_minutes: None,
        }
    }

    pub fn with_window_minutes(mut self, minutes: Option<u64>) -> Self {
        self.window_minutes = minutes.filter(|m| *m > 0);
        self
    }
}

fn clamp_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, 100.0) as u8
}

/// Per-backend quota report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderQuota {
    pub provider: String,
    pub display_name: String,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Usually the short (5h) window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<QuotaWindow>,
    /// Usually the long (7d) window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<QuotaWindow>,
    /// Per-model weekly windows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_models: Option<BTreeMap<String, QuotaWindow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<BTreeMap<String, QuotaWindow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_usage: Option<ExtraUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, String>>,
}

impl ProviderQuota {
    /// An available report with no windows filled in yet.
    pub fn available(provider: &str, display_name: &str) -> Self {
        Self {
            provider: provider.to_string(),
            display_name: display_name.to_string(),
            available: true,
            account: None,
            plan: None,
            error: None,
            error_kind: None,
            primary: None,
            secondary: None,
            weekly_models: None,
            models: None,
            extra_usage: None,
            meta: None,
        }
    }

    /// An unavailable report; always carries a non-empty error.
    pub fn failed(provider: &str, display_name: &str, err: &QuotaError) -> Self {
        let mut message = err.to_string();
        if message.trim().is_empty() {
            message = "Unknown error".to_string();
        }
        Self {
            available: false,
            error: Some(message),
            error_kind: Some(err.kind()),
            ..Self::available(provider, display_name)
        }
    }

    pub fn with_plan(mut self, plan: Option<String>) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.meta
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.into());
        self
    }
}

/// One report per registered provider, in registration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllQuotas {
    pub providers: Vec<ProviderQuota>,
    pub fetched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_percent_maps_into_remaining_range() {
        for used in 0..=100 {
            let w = QuotaWindow::from_used_percent(used as f64, None);
            assert_eq!(w.remaining as i32, 100 - used);
        }
        for used in [0.4, 0.5, 49.5, 99.6, 100.0] {
            let w = QuotaWindow::from_used_percent(used, None);
            assert!(w.remaining <= 100);
        }
    }

    #[test]
    fn used_percent_out_of_range_is_clamped() {
        assert_eq!(QuotaWindow::from_used_percent(130.0, None).remaining, 0);
        assert_eq!(QuotaWindow::from_used_percent(-12.0, None).remaining, 100);
        assert_eq!(QuotaWindow::from_used_percent(f64::NAN, None).remaining, 0);
    }

    #[test]
    fn remaining_fraction_truncates() {
        assert_eq!(QuotaWindow::from_remaining_fraction(0.759, None).remaining, 75);
        assert_eq!(QuotaWindow::from_remaining_fraction(1.0, None).remaining, 100);
        assert_eq!(QuotaWindow::from_remaining_fraction(1.7, None).remaining, 100);
    }

    #[test]
    fn zero_window_minutes_is_unknown() {
        let w = QuotaWindow::from_used_percent(10.0, None).with_window_minutes(Some(0));
        assert_eq!(w.window_minutes, None);
    }

    #[test]
    fn failed_report_is_unavailable_with_error() {
        let q = ProviderQuota::failed("claude", "Claude", &QuotaError::not_logged_in());
        assert!(!q.available);
        assert_eq!(q.error.as_deref(), Some("Not logged in"));
        assert_eq!(q.error_kind, Some(ErrorKind::NotAuthenticated));
    }

    #[test]
    fn failed_report_never_has_empty_error() {
        let q = ProviderQuota::failed("x", "X", &QuotaError::Unknown(String::new()));
        assert_eq!(q.error.as_deref(), Some("Unknown error"));
    }

    #[test]
    fn serializes_camel_case_and_skips_empty() {
        let q = ProviderQuota::available("codex", "Codex").with_meta("source", "cache");
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["displayName"], "Codex");
        assert_eq!(json["meta"]["source"], "cache");
        assert!(json.get("error").is_none());
        assert!(json.get("primary").is_none());
    }
}
