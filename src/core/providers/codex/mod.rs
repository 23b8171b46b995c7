pub mod limits;
pub mod rpc;
pub mod sessions;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tracing::{debug, info};

use crate::core::auth::{codex_auth_exists, read_codex_account};
use crate::core::context::Context;
use crate::core::error::QuotaError;
use crate::core::models::usage::ProviderQuota;
use crate::core::process::which;
use crate::core::providers::{ProviderId, QuotaProvider};
use limits::RateLimitSnapshot;

const CACHE_KEY: &str = "codex-quota";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Cache,
    AppServer,
    SessionLog,
}

impl Source {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::AppServer => "app-server",
            Self::SessionLog => "session-log",
        }
    }
}

/// Rate limits from the Codex CLI: the app-server first, then the
/// newest session log.
pub struct CodexProvider {
    ctx: Arc<Context>,
}

impl CodexProvider {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn rate_limits(&self) -> Result<(RateLimitSnapshot, Source), QuotaError> {
        if let Some(cached) = self.ctx.cache.get::<RateLimitSnapshot>(CACHE_KEY).await {
            return Ok((cached, Source::Cache));
        }

        let (snapshot, source) = match self.from_app_server().await {
            Some(snapshot) => (snapshot, Source::AppServer),
            None => {
                let today = Local::now().date_naive();
                let snapshot = sessions::read_rate_limits(&self.ctx.codex.sessions_dir(), today).await?;
                (snapshot, Source::SessionLog)
            }
        };

        self.ctx.cache.set(CACHE_KEY, &snapshot, self.ctx.ttls.codex).await;
        Ok((snapshot, source))
    }

    /// `None` on any failure so the session log gets a chance.
    async fn from_app_server(&self) -> Option<RateLimitSnapshot> {
        let env = &self.ctx.codex;
        if which(&env.binary).is_none() {
            debug!(binary = %env.binary, "Codex binary not on PATH");
            return None;
        }
        match rpc::read_rate_limits(env, self.ctx.timeouts.rpc).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                info!(error = %e, "Codex app-server unavailable, using session log");
                None
            }
        }
    }
}

#[async_trait]
impl QuotaProvider for CodexProvider {
    fn id(&self) -> &str {
        ProviderId::Codex.id()
    }

    fn display_name(&self) -> &str {
        ProviderId::Codex.display_name()
    }

    fn cache_keys(&self) -> &'static [&'static str] {
        &[CACHE_KEY]
    }

    async fn is_available(&self) -> bool {
        codex_auth_exists(&self.ctx.codex.auth_path()).await
    }

    async fn get_quota(&self) -> ProviderQuota {
        let auth_path = self.ctx.codex.auth_path();
        if !codex_auth_exists(&auth_path).await {
            return ProviderQuota::failed(self.id(), self.display_name(), &QuotaError::not_logged_in());
        }
        let account = read_codex_account(&auth_path).await;

        let mut quota = match self.rate_limits().await {
            Ok((snapshot, source)) => build_quota(&snapshot, source),
            Err(e) => ProviderQuota::failed(self.id(), self.display_name(), &e),
        };
        quota.account = account;
        quota
    }
}

fn build_quota(snapshot: &RateLimitSnapshot, source: Source) -> ProviderQuota {
    let mut quota = ProviderQuota::available(ProviderId::Codex.id(), ProviderId::Codex.display_name())
        .with_plan(snapshot.plan_type.clone().filter(|p| !p.is_empty()))
        .with_meta("source", source.as_str());
    quota.primary = snapshot.primary.as_ref().map(|w| w.to_quota_window());
    quota.secondary = snapshot.secondary.as_ref().map(|w| w.to_quota_window());
    quota.extra_usage = snapshot.extra_usage();
    quota
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use std::path::Path;
    use std::time::Duration;

    const SESSION_LINE: &str = r#"{"timestamp":"2025-06-01T10:00:00Z","type":"event_msg","payload":{"type":"token_count","rate_limits":{"primary":{"used_percent":25.0,"window_minutes":300,"resets_at":1748779200},"secondary":{"used_percent":60.4,"window_minutes":10080,"resets_at":0}}}}"#;

    fn context(root: &Path) -> Context {
        let ctx = Context::for_tests(root);
        std::fs::create_dir_all(&ctx.codex.home).unwrap();
        std::fs::write(ctx.codex.auth_path(), r#"{"tokens":{}}"#).unwrap();
        ctx
    }

    fn write_today_session(ctx: &Context, line: &str) {
        let today = Local::now().date_naive();
        let dir = ctx
            .codex
            .sessions_dir()
            .join(today.format("%Y").to_string())
            .join(today.format("%m").to_string())
            .join(today.format("%d").to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("rollout.jsonl"), line).unwrap();
    }

    fn scripted_server(ctx: &mut Context, script: &str) {
        ctx.codex.binary = "sh".to_string();
        ctx.codex.args = vec!["-c".to_string(), script.to_string()];
    }

    #[tokio::test]
    async fn not_logged_in_without_auth_file() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = CodexProvider::new(Arc::new(Context::for_tests(tmp.path())));
        assert!(!provider.is_available().await);

        let quota = provider.get_quota().await;
        assert!(!quota.available);
        assert_eq!(quota.error.as_deref(), Some("Not logged in"));
        assert_eq!(quota.error_kind, Some(ErrorKind::NotAuthenticated));
    }

    #[tokio::test]
    async fn missing_binary_falls_back_to_session_log() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        write_today_session(&ctx, SESSION_LINE);

        let provider = CodexProvider::new(Arc::new(ctx));
        assert!(provider.is_available().await);
        let quota = provider.get_quota().await;

        assert!(quota.available, "{:?}", quota.error);
        assert_eq!(quota.primary.as_ref().unwrap().remaining, 75);
        assert_eq!(quota.secondary.as_ref().unwrap().remaining, 40);
        assert!(quota.secondary.unwrap().resets_at.is_none());
        assert_eq!(quota.meta.unwrap()["source"], "session-log");
    }

    #[tokio::test]
    async fn no_session_data_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let quota = CodexProvider::new(Arc::new(context(tmp.path()))).get_quota().await;
        assert!(!quota.available);
        assert_eq!(quota.error.as_deref(), Some("No session data found"));
        assert_eq!(quota.error_kind, Some(ErrorKind::NoData));
    }

    #[tokio::test]
    async fn app_server_result_is_preferred_and_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = context(tmp.path());
        write_today_session(&ctx, SESSION_LINE);
        scripted_server(
            &mut ctx,
            r#"read init
printf '%s\n' '{"id":0,"result":{}}'
read initialized
read request
printf '%s\n' '{"id":1,"result":{"rateLimits":{"primary":{"usedPercent":10,"windowDurationMins":300,"resetsAt":1735000000},"credits":{"hasCredits":true,"unlimited":false,"balance":"5.00"},"planType":"plus"}}}'
exec sleep 30"#,
        );

        let provider = CodexProvider::new(Arc::new(ctx));
        let quota = provider.get_quota().await;
        assert!(quota.available, "{:?}", quota.error);
        assert_eq!(quota.primary.as_ref().unwrap().remaining, 90);
        assert!(quota.secondary.is_none());
        assert_eq!(quota.plan.as_deref(), Some("plus"));
        assert_eq!(quota.extra_usage.as_ref().unwrap().remaining, 500);
        assert_eq!(quota.meta.as_ref().unwrap()["source"], "app-server");

        let again = provider.get_quota().await;
        assert_eq!(again.meta.as_ref().unwrap()["source"], "cache");
        assert_eq!(again.primary, quota.primary);
    }

    #[tokio::test]
    async fn cache_hit_skips_retrieval() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = context(tmp.path());
        // A subprocess that would fail the test if it were ever spawned
        let marker = tmp.path().join("spawned");
        scripted_server(&mut ctx, &format!("touch '{}'; exit 1", marker.display()));
        let snapshot: RateLimitSnapshot =
            serde_json::from_str(r#"{"primary":{"used_percent":50.0,"resets_at":1735000000}}"#).unwrap();
        ctx.cache.set(CACHE_KEY, &snapshot, Duration::from_secs(60)).await;

        let quota = CodexProvider::new(Arc::new(ctx)).get_quota().await;
        assert_eq!(quota.primary.unwrap().remaining, 50);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn stalled_app_server_is_killed_before_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = context(tmp.path());
        write_today_session(&ctx, SESSION_LINE);
        let pid_file = tmp.path().join("server.pid");
        scripted_server(
            &mut ctx,
            &format!("echo $$ > '{}'; exec sleep 30", pid_file.display()),
        );
        ctx.timeouts.rpc = Duration::from_millis(300);

        let started = std::time::Instant::now();
        let quota = CodexProvider::new(Arc::new(ctx)).get_quota().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(quota.available, "{:?}", quota.error);
        assert_eq!(quota.meta.unwrap()["source"], "session-log");

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        #[cfg(target_os = "linux")]
        assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
        #[cfg(not(target_os = "linux"))]
        let _ = pid;
    }

    #[tokio::test]
    async fn account_comes_from_id_token() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let claims = URL_SAFE_NO_PAD.encode(r#"{"email":"dev@example.com"}"#);
        let auth = format!(r#"{{"tokens":{{"id_token":"h.{}.s"}}}}"#, claims);
        std::fs::write(ctx.codex.auth_path(), auth).unwrap();
        write_today_session(&ctx, SESSION_LINE);

        let quota = CodexProvider::new(Arc::new(ctx)).get_quota().await;
        assert_eq!(quota.account.as_deref(), Some("dev@example.com"));
    }
}
