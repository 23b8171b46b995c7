pub mod antigravity;
pub mod claude;
pub mod codex;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::context::Context;
use crate::core::models::usage::ProviderQuota;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Claude,
    Codex,
    Antigravity,
}

impl ProviderId {
    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "antigravity" => Some(Self::Antigravity),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Antigravity => "antigravity",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Claude => "Claude",
            Self::Codex => "Codex",
            Self::Antigravity => "Antigravity",
        }
    }

    /// All providers in registration order.
    pub fn all() -> &'static [ProviderId] {
        &[ProviderId::Claude, ProviderId::Codex, ProviderId::Antigravity]
    }

    pub fn auth_hint(&self) -> &'static str {
        match self {
            Self::Claude => "auto-detected (~/.claude/.credentials.json)",
            Self::Codex => "auto-detected (~/.codex/auth.json)",
            Self::Antigravity => "language server process",
        }
    }
}

/// One quota backend.
///
/// `get_quota` reports every failure inside the returned record; it only
/// panics on a bug, which the aggregator contains.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Cache key prefixes this provider writes, for forced refreshes.
    /// Entries may be scoped as `<prefix>-<hash>`.
    fn cache_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether credentials or a local runtime are present. Never errors.
    async fn is_available(&self) -> bool;

    async fn get_quota(&self) -> ProviderQuota;
}

/// Fixed, ordered set of providers.
#[derive(Clone)]
pub struct Registry {
    providers: Vec<Arc<dyn QuotaProvider>>,
}

impl Registry {
    pub fn new(providers: Vec<Arc<dyn QuotaProvider>>) -> Self {
        Self { providers }
    }

    /// Claude, Codex, Antigravity, in that order.
    pub fn builtin(ctx: Arc<Context>) -> Self {
        Self::new(
            ProviderId::all()
                .iter()
                .map(|id| -> Arc<dyn QuotaProvider> {
                    match id {
                        ProviderId::Claude => Arc::new(claude::ClaudeProvider::new(ctx.clone())),
                        ProviderId::Codex => Arc::new(codex::CodexProvider::new(ctx.clone())),
                        ProviderId::Antigravity => {
                            Arc::new(antigravity::AntigravityProvider::new(ctx.clone()))
                        }
                    }
                })
                .collect(),
        )
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn QuotaProvider>> {
        self.providers
            .iter()
            .find(|p| p.id().eq_ignore_ascii_case(id))
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn QuotaProvider>> {
        self.providers.iter()
    }
}
