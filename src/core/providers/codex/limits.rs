use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::core::models::credits::{dollars_to_cents, ExtraUsage};
use crate::core::models::usage::QuotaWindow;

/// Rate-limit state as reported by Codex, in either of its two spellings:
/// camelCase from the app-server, snake_case in session logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub primary: Option<LimitWindow>,
    pub secondary: Option<LimitWindow>,
    pub credits: Option<CreditsInfo>,
    #[serde(default, alias = "planType")]
    pub plan_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitWindow {
    #[serde(alias = "usedPercent")]
    pub used_percent: f64,
    #[serde(default, alias = "windowDurationMins", alias = "windowMinutes")]
    pub window_minutes: Option<u64>,
    /// Epoch seconds; non-positive means unknown
    #[serde(default, alias = "resetsAt")]
    pub resets_at: Option<i64>,
    /// Older session logs only give a countdown relative to the record
    #[serde(default, skip_serializing, alias = "resetsInSeconds")]
    pub resets_in_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditsInfo {
    #[serde(default, alias = "hasCredits")]
    pub has_credits: Option<bool>,
    #[serde(default)]
    pub unlimited: Option<bool>,
    /// Dollars
    #[serde(default, deserialize_with = "deserialize_balance")]
    pub balance: Option<f64>,
}

/// `balance` arrives as a JSON number or a numeric string.
fn deserialize_balance<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => Ok(n.as_f64()),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::String(s) => s.trim().parse::<f64>().map(Some).map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected number or string for balance, got {:?}",
            other
        ))),
    }
}

impl RateLimitSnapshot {
    pub fn has_windows(&self) -> bool {
        self.primary.is_some() || self.secondary.is_some()
    }

    /// Turn countdown-style resets into absolute epoch seconds.
    pub fn anchor_relative_resets(&mut self, recorded_at: DateTime<Utc>) {
        for window in [self.primary.as_mut(), self.secondary.as_mut()].into_iter().flatten() {
            if window.resets_at.is_none() {
                if let Some(secs) = window.resets_in_seconds {
                    window.resets_at = Some(recorded_at.timestamp() + secs);
                }
            }
        }
    }

    /// Shown only for a positive or unlimited balance.
    pub fn extra_usage(&self) -> Option<ExtraUsage> {
        let credits = self.credits.as_ref()?;
        let unlimited = credits.unlimited.unwrap_or(false);
        let balance = credits.balance.unwrap_or(0.0);
        if !unlimited && balance <= 0.0 {
            return None;
        }
        Some(ExtraUsage::from_balance(dollars_to_cents(balance), unlimited))
    }
}

impl LimitWindow {
    pub fn to_quota_window(&self) -> QuotaWindow {
        QuotaWindow::from_used_percent(self.used_percent, epoch_to_datetime(self.resets_at))
            .with_window_minutes(self.window_minutes)
    }
}

fn epoch_to_datetime(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.filter(|s| *s > 0)
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
}
