use serde::{Deserialize, Serialize};

/// Pay-as-you-go balance beyond the subscription windows. Amounts in cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraUsage {
    pub enabled: bool,
    pub remaining: i64,
    pub used: i64,
    pub limit: i64,
    /// No spending cap; `limit` is meaningless when set
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unlimited: bool,
}

impl ExtraUsage {
    /// From a monthly cap and the amount spent so far.
    pub fn from_limit(limit: i64, used: i64) -> Self {
        Self {
            enabled: true,
            remaining: (limit - used).max(0),
            used,
            limit,
            unlimited: false,
        }
    }

    /// From a prepaid balance with no known cap.
    pub fn from_balance(balance: i64, unlimited: bool) -> Self {
        Self {
            enabled: true,
            remaining: balance.max(0),
            used: 0,
            limit: 0,
            unlimited,
        }
    }
}

/// Dollars (as reported by most backends) to whole cents.
pub fn dollars_to_cents(dollars: f64) -> i64 {
    (dollars * 100.0).round() as i64
}
