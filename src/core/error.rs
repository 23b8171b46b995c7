use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a provider could not produce quota data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotAuthenticated,
    Timeout,
    Upstream,
    NoData,
    CacheUnavailable,
    Unknown,
}

/// A fetch-level failure. `Display` is the user-facing message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("{0}")]
    NotAuthenticated(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    NoData(String),
    #[error("{0}")]
    CacheUnavailable(String),
    #[error("{0}")]
    Unknown(String),
}

impl QuotaError {
    pub fn not_logged_in() -> Self {
        Self::NotAuthenticated("Not logged in".to_string())
    }

    pub fn request_timeout() -> Self {
        Self::Timeout("Request timeout".to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAuthenticated(_) => ErrorKind::NotAuthenticated,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Upstream(_) => ErrorKind::Upstream,
            Self::NoData(_) => ErrorKind::NoData,
            Self::CacheUnavailable(_) => ErrorKind::CacheUnavailable,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }
}
