use std::path::PathBuf;
use std::time::Duration;

use crate::core::cache::CacheStore;
use crate::core::config::AppConfig;

pub const CLAUDE_USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub http: Duration,
    pub rpc: Duration,
    pub cli: Duration,
    pub discovery: Duration,
}

#[derive(Debug, Clone)]
pub struct Ttls {
    pub default: Duration,
    pub codex: Duration,
    pub antigravity: Duration,
}

#[derive(Debug, Clone)]
pub struct ClaudeEnv {
    pub credentials_path: PathBuf,
    pub usage_url: String,
}

#[derive(Debug, Clone)]
pub struct CodexEnv {
    pub home: PathBuf,
    pub binary: String,
    pub args: Vec<String>,
}

impl CodexEnv {
    pub fn auth_path(&self) -> PathBuf {
        self.home.join("auth.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }
}

#[derive(Debug, Clone)]
pub struct AntigravityEnv {
    pub process_name: String,
    pub cli_binary: String,
    pub max_ports: usize,
    /// `https` in production; tests point the probe at plain-HTTP servers
    pub scheme: String,
}

/// Everything a provider needs from its surroundings, resolved once.
#[derive(Debug, Clone)]
pub struct Context {
    pub cache: CacheStore,
    pub timeouts: Timeouts,
    pub ttls: Ttls,
    pub claude: ClaudeEnv,
    pub codex: CodexEnv,
    pub antigravity: AntigravityEnv,
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
}

fn default_codex_home() -> PathBuf {
    std::env::var("CODEX_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".codex"))
}

impl Context {
    pub fn from_config(config: &AppConfig) -> Self {
        let cache_dir = config
            .cache
            .dir
            .clone()
            .unwrap_or_else(AppConfig::default_cache_dir);

        Self {
            cache: CacheStore::new(
                cache_dir,
                Duration::from_millis(config.cache.lock_timeout_ms),
            ),
            timeouts: Timeouts {
                http: Duration::from_millis(config.timeouts.http_ms),
                rpc: Duration::from_millis(config.timeouts.rpc_ms),
                cli: Duration::from_millis(config.timeouts.cli_ms),
                discovery: Duration::from_millis(config.timeouts.discovery_ms),
            },
            ttls: Ttls {
                default: Duration::from_secs(config.cache.ttl_secs),
                codex: Duration::from_secs(config.cache.codex_ttl_secs),
                antigravity: Duration::from_secs(config.cache.antigravity_ttl_secs),
            },
            claude: ClaudeEnv {
                credentials_path: config
                    .claude
                    .credentials_path
                    .clone()
                    .unwrap_or_else(|| home().join(".claude").join(".credentials.json")),
                usage_url: config
                    .claude
                    .usage_url
                    .clone()
                    .unwrap_or_else(|| CLAUDE_USAGE_URL.to_string()),
            },
            codex: CodexEnv {
                home: config.codex.home.clone().unwrap_or_else(default_codex_home),
                binary: config.codex.binary.clone(),
                args: ["-s", "read-only", "-a", "untrusted", "app-server"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            antigravity: AntigravityEnv {
                process_name: config.antigravity.process_name.clone(),
                cli_binary: config.antigravity.cli_binary.clone(),
                max_ports: config.antigravity.max_ports,
                scheme: "https".to_string(),
            },
        }
    }

    /// A context rooted entirely inside `root`: nothing touches the real
    /// home directory, and no real binaries are resolved.
    #[cfg(test)]
    pub fn for_tests(root: &std::path::Path) -> Self {
        let mut config = AppConfig::default();
        config.cache.dir = Some(root.join("cache"));
        config.cache.lock_timeout_ms = 500;
        config.claude.credentials_path = Some(root.join("claude").join(".credentials.json"));
        config.codex.home = Some(root.join("codex"));
        config.codex.binary = "qbar-test-missing-codex".to_string();
        config.antigravity.process_name = "qbar-test-missing-language-server".to_string();
        config.antigravity.cli_binary = "qbar-test-missing-antigravity-usage".to_string();
        let mut ctx = Self::from_config(&config);
        ctx.antigravity.scheme = "http".to_string();
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_applies_defaults() {
        let ctx = Context::from_config(&AppConfig::default());
        assert_eq!(ctx.timeouts.http, Duration::from_secs(5));
        assert_eq!(ctx.timeouts.rpc, Duration::from_secs(4));
        assert_eq!(ctx.ttls.antigravity, Duration::from_secs(900));
        assert_eq!(ctx.claude.usage_url, CLAUDE_USAGE_URL);
        assert_eq!(ctx.antigravity.scheme, "https");
        assert_eq!(ctx.antigravity.max_ports, 3);
        assert!(ctx.codex.args.ends_with(&["app-server".to_string()]));
    }

    #[test]
    fn from_config_honours_overrides() {
        let mut config = AppConfig::default();
        config.cache.dir = Some(PathBuf::from("/tmp/qbar-cache"));
        config.codex.home = Some(PathBuf::from("/tmp/codex-home"));
        let ctx = Context::from_config(&config);
        assert_eq!(ctx.cache.dir(), std::path::Path::new("/tmp/qbar-cache"));
        assert_eq!(ctx.codex.auth_path(), PathBuf::from("/tmp/codex-home/auth.json"));
        assert_eq!(ctx.codex.sessions_dir(), PathBuf::from("/tmp/codex-home/sessions"));
    }
}
