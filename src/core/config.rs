use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::core::cache::DEFAULT_TTL;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Defaults to `$XDG_CACHE_HOME/qbar`
    pub dir: Option<PathBuf>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub codex_ttl_secs: u64,
    #[serde(default = "default_antigravity_ttl_secs")]
    pub antigravity_ttl_secs: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL.as_secs()
}
fn default_antigravity_ttl_secs() -> u64 {
    900
}
fn default_lock_timeout_ms() -> u64 {
    5_000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_secs: default_ttl_secs(),
            codex_ttl_secs: default_ttl_secs(),
            antigravity_ttl_secs: default_antigravity_ttl_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_http_ms")]
    pub http_ms: u64,
    #[serde(default = "default_rpc_ms")]
    pub rpc_ms: u64,
    #[serde(default = "default_cli_ms")]
    pub cli_ms: u64,
    #[serde(default = "default_discovery_ms")]
    pub discovery_ms: u64,
}

fn default_http_ms() -> u64 {
    5_000
}
fn default_rpc_ms() -> u64 {
    4_000
}
fn default_cli_ms() -> u64 {
    5_000
}
fn default_discovery_ms() -> u64 {
    3_000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            http_ms: default_http_ms(),
            rpc_ms: default_rpc_ms(),
            cli_ms: default_cli_ms(),
            discovery_ms: default_discovery_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaudeSettings {
    /// Defaults to `~/.claude/.credentials.json`
    pub credentials_path: Option<PathBuf>,
    pub usage_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexSettings {
    /// Defaults to `$CODEX_HOME`, then `~/.codex`
    pub home: Option<PathBuf>,
    #[serde(default = "default_codex_binary")]
    pub binary: String,
}

fn default_codex_binary() -> String {
    "codex".to_string()
}

impl Default for CodexSettings {
    fn default() -> Self {
        Self {
            home: None,
            binary: default_codex_binary(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntigravitySettings {
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default = "default_cli_binary")]
    pub cli_binary: String,
    #[serde(default = "default_max_ports")]
    pub max_ports: usize,
}

fn default_process_name() -> String {
    if cfg!(target_os = "macos") {
        "language_server_macos".to_string()
    } else {
        "language_server_linux".to_string()
    }
}
fn default_cli_binary() -> String {
    "antigravity-usage".to_string()
}
fn default_max_ports() -> usize {
    3
}

impl Default for AntigravitySettings {
    fn default() -> Self {
        Self {
            process_name: default_process_name(),
            cli_binary: default_cli_binary(),
            max_ports: default_max_ports(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub claude: ClaudeSettings,
    #[serde(default)]
    pub codex: CodexSettings,
    #[serde(default)]
    pub antigravity: AntigravitySettings,
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join(fallback)
        })
}

impl AppConfig {
    /// Get the config file path, respecting XDG_CONFIG_HOME
    pub fn config_path() -> PathBuf {
        xdg_dir("XDG_CONFIG_HOME", ".config")
            .join("qbar")
            .join("config.toml")
    }

    pub fn default_cache_dir() -> PathBuf {
        xdg_dir("XDG_CACHE_HOME", ".cache").join("qbar")
    }

    /// Load config from the default path, falling back to defaults if not found
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Serialize and write this config to the config file path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Validate the config
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let timeouts = [
            ("timeouts.http_ms", self.timeouts.http_ms),
            ("timeouts.rpc_ms", self.timeouts.rpc_ms),
            ("timeouts.cli_ms", self.timeouts.cli_ms),
            ("timeouts.discovery_ms", self.timeouts.discovery_ms),
            ("cache.lock_timeout_ms", self.cache.lock_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                issues.push(format!("{} must be greater than zero", name));
            }
        }
        if self.antigravity.max_ports == 0 {
            issues.push("antigravity.max_ports must be at least 1".to_string());
        }
        if self.codex.binary.trim().is_empty() {
            issues.push("codex.binary must not be empty".to_string());
        }
        if let Some(url) = &self.claude.usage_url {
            if !url.starts_with("https://") {
                issues.push(format!("claude.usage_url must use HTTPS, got: {}", url));
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let config = AppConfig::default();
        let issues = config.validate();
        assert!(issues.is_empty(), "Default config should be valid, got: {:?}", issues);
    }

    #[test]
    fn default_ttls() {
        let cache = CacheSettings::default();
        assert_eq!(cache.ttl_secs, 300);
        assert_eq!(cache.codex_ttl_secs, 300);
        assert_eq!(cache.antigravity_ttl_secs, 900);
        assert_eq!(cache.lock_timeout_ms, 5_000);
    }

    #[test]
    fn default_timeouts() {
        let t = TimeoutSettings::default();
        assert_eq!(t.http_ms, 5_000);
        assert_eq!(t.rpc_ms, 4_000);
    }

    #[test]
    fn validate_catches_zero_timeout() {
        let mut config = AppConfig::default();
        config.timeouts.rpc_ms = 0;
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.contains("rpc_ms")));
    }

    #[test]
    fn validate_catches_zero_ports() {
        let mut config = AppConfig::default();
        config.antigravity.max_ports = 0;
        assert!(config.validate().iter().any(|i| i.contains("max_ports")));
    }

    #[test]
    fn validate_rejects_plain_http_usage_url() {
        let mut config = AppConfig::default();
        config.claude.usage_url = Some("http://evil.example".into());
        assert!(config.validate().iter().any(|i| i.contains("HTTPS")));
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let toml = r#"
[cache]
ttl_secs = 60

[codex]
binary = "/opt/codex/bin/codex"
"#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.antigravity_ttl_secs, 900);
        assert_eq!(config.codex.binary, "/opt/codex/bin/codex");
        assert_eq!(config.timeouts.http_ms, 5_000);
        assert_eq!(config.antigravity.max_ports, 3);
    }

    #[test]
    fn parse_empty_toml_gives_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.codex.binary, "codex");
        assert_eq!(config.antigravity.cli_binary, "antigravity-usage");
    }

    #[test]
    fn default_config_roundtrips_through_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let config: AppConfig = toml::from_str(&text).unwrap();
        assert!(config.validate().is_empty());
    }
}
