pub mod cli_fallback;
pub mod discovery;
pub mod probe;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::cache::scoped_key;
use crate::core::context::Context;
use crate::core::error::QuotaError;
use crate::core::models::usage::{ProviderQuota, QuotaWindow};
use crate::core::providers::{ProviderId, QuotaProvider};
use discovery::LanguageServer;

/// Prefix; entries are scoped to one language server by its CSRF token.
const CACHE_KEY: &str = "antigravity-quota";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportSource {
    LanguageServer,
    Cli,
}

impl ReportSource {
    fn as_str(&self) -> &'static str {
        match self {
            Self::LanguageServer => "language-server",
            Self::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabeledQuota {
    pub label: String,
    pub window: QuotaWindow,
}

/// Per-model quotas for one account, whichever path produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub account: String,
    pub models: Vec<LabeledQuota>,
    /// Label of the model promoted to the primary window
    pub primary: Option<String>,
    pub source: ReportSource,
    pub port: Option<u16>,
}

/// Model quotas from the Antigravity IDE's local language server.
pub struct AntigravityProvider {
    ctx: Arc<Context>,
}

impl AntigravityProvider {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn cached_report(&self, server: &LanguageServer) -> Option<QuotaReport> {
        self.ctx.cache.get::<QuotaReport>(&cache_key(server)).await
    }

    async fn report(&self, server: &LanguageServer) -> Result<(QuotaReport, bool), QuotaError> {
        if let Some(cached) = self.cached_report(server).await {
            return Ok((cached, true));
        }

        let ports = discovery::find_listening_ports(
            self.ctx.antigravity.max_ports,
            self.ctx.timeouts.discovery,
        )
        .await?;
        let report = self.fetch_from_ports(&server.csrf_token, &ports).await?;
        self.ctx
            .cache
            .set(&cache_key(server), &report, self.ctx.ttls.antigravity)
            .await;
        Ok((report, false))
    }

    /// Probe loop, then the companion CLI.
    async fn fetch_from_ports(&self, csrf_token: &str, ports: &[u16]) -> Result<QuotaReport, QuotaError> {
        let env = &self.ctx.antigravity;
        if let Some(report) = probe::probe_ports(&env.scheme, csrf_token, ports, self.ctx.timeouts.http).await {
            return Ok(report);
        }
        info!(?ports, "No language server port answered, trying {}", env.cli_binary);
        cli_fallback::read_quota(&env.cli_binary, self.ctx.timeouts.cli).await
    }
}

#[async_trait]
impl QuotaProvider for AntigravityProvider {
    fn id(&self) -> &str {
        ProviderId::Antigravity.id()
    }

    fn display_name(&self) -> &str {
        ProviderId::Antigravity.display_name()
    }

    fn cache_keys(&self) -> &'static [&'static str] {
        &[CACHE_KEY]
    }

    async fn is_available(&self) -> bool {
        discovery::find_language_server(&self.ctx.antigravity.process_name, self.ctx.timeouts.discovery)
            .await
            .is_ok()
    }

    async fn get_quota(&self) -> ProviderQuota {
        let server = match discovery::find_language_server(
            &self.ctx.antigravity.process_name,
            self.ctx.timeouts.discovery,
        )
        .await
        {
            Ok(s) => s,
            Err(e) => return ProviderQuota::failed(self.id(), self.display_name(), &e),
        };
        debug!(pid = server.pid, "Found Antigravity language server");

        match self.report(&server).await {
            Ok((report, cached)) => build_quota(report, cached),
            Err(e) => ProviderQuota::failed(self.id(), self.display_name(), &e),
        }
    }
}

fn cache_key(server: &LanguageServer) -> String {
    scoped_key(CACHE_KEY, &server.csrf_token)
}

fn build_quota(report: QuotaReport, cached: bool) -> ProviderQuota {
    let source = if cached { "cache" } else { report.source.as_str() };
    let mut quota = ProviderQuota::available(
        ProviderId::Antigravity.id(),
        ProviderId::Antigravity.display_name(),
    )
    .with_meta("source", source);
    if let Some(port) = report.port {
        quota = quota.with_meta("port", port.to_string());
    }

    quota.primary = report.primary.as_ref().and_then(|label| {
        report
            .models
            .iter()
            .find(|m| &m.label == label)
            .map(|m| m.window.clone())
    });
    quota.account = Some(report.account);
    quota.models = Some(report.models.into_iter().map(|m| (m.label, m.window)).collect());
    quota
}
