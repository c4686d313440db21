//! Configuration tree for the SpriteDeck gateway.
//!
//! Loaded from `config.toml` (every section optional, every field
//! default-able) with environment overrides for infrastructure values
//! (`HOST`, `PORT`, `DATABASE_PATH`). Secrets are never stored in the
//! file — each section names the env var that carries its secret.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sprites: SpritesConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub oauth: OauthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for infrastructure values.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.is_empty() {
                self.database.path = PathBuf::from(path);
            }
        }
    }

    /// Validate the configuration, returning every issue found.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();

        if self.sprites.base_url.is_empty() {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sprites.base_url".into(),
                message: "sprite API base URL must not be empty".into(),
            });
        }
        if std::env::var(&self.sprites.token_env)
            .map(|v| v.is_empty())
            .unwrap_or(true)
        {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sprites.token_env".into(),
                message: format!(
                    "env var {} is required for sprite API authentication",
                    self.sprites.token_env
                ),
            });
        }
        if self.sessions.idle_timeout_secs == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "sessions.idle_timeout_secs".into(),
                message: "idle timeout of 0 disables sprite hibernation".into(),
            });
        }
        if self.oauth.client_id.is_empty() {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "oauth.client_id".into(),
                message: "no OAuth client_id — token refresh will fail".into(),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Environment variable holding the UI gate password.
    /// Unset env var = dev mode (no auth enforced).
    #[serde(default = "d_password_env")]
    pub password_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            password_env: d_password_env(),
        }
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8384
}
fn d_password_env() -> String {
    "SERVICE_PASSWORD".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sprites (sandbox API)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpritesConfig {
    /// Base URL of the remote sprite API (HTTPS).
    #[serde(default = "d_sprites_base_url")]
    pub base_url: String,
    /// Name of the sprite tasks route to. MVP: one shared sprite.
    #[serde(default = "d_default_sprite")]
    pub default_sprite: String,
    /// Environment variable holding the sprite API bearer token.
    #[serde(default = "d_sprite_token_env")]
    pub token_env: String,
    /// One-shot exec default timeout.
    #[serde(default = "d_exec_timeout")]
    pub exec_timeout_secs: u64,
    /// Timeout for `git clone` inside the sprite.
    #[serde(default = "d_clone_timeout")]
    pub clone_timeout_secs: u64,
    /// Timeout for `git pull` inside the sprite.
    #[serde(default = "d_pull_timeout")]
    pub pull_timeout_secs: u64,
    /// Timeout for `git config` probes inside the sprite.
    #[serde(default = "d_git_config_timeout")]
    pub git_config_timeout_secs: u64,
}

impl Default for SpritesConfig {
    fn default() -> Self {
        Self {
            base_url: d_sprites_base_url(),
            default_sprite: d_default_sprite(),
            token_env: d_sprite_token_env(),
            exec_timeout_secs: d_exec_timeout(),
            clone_timeout_secs: d_clone_timeout(),
            pull_timeout_secs: d_pull_timeout(),
            git_config_timeout_secs: d_git_config_timeout(),
        }
    }
}

fn d_sprites_base_url() -> String {
    "https://api.sprites.dev".into()
}
fn d_default_sprite() -> String {
    "spritedeck".into()
}
fn d_sprite_token_env() -> String {
    "SPRITE_TOKEN".into()
}
fn d_exec_timeout() -> u64 {
    60
}
fn d_clone_timeout() -> u64 {
    300
}
fn d_pull_timeout() -> u64 {
    120
}
fn d_git_config_timeout() -> u64 {
    30
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent (the inner process spawned in the sprite)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Binary name of the inner agent inside the sprite.
    #[serde(default = "d_agent_binary")]
    pub binary: String,
    /// Env var with the legacy fallback access token (used to seed the
    /// token manager when the database holds no row).
    #[serde(default = "d_oauth_token_env")]
    pub oauth_token_env: String,
    /// Env var with the optional GitHub token forwarded to the agent.
    #[serde(default = "d_github_token_env")]
    pub github_token_env: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: d_agent_binary(),
            oauth_token_env: d_oauth_token_env(),
            github_token_env: d_github_token_env(),
        }
    }
}

fn d_agent_binary() -> String {
    "agent".into()
}
fn d_oauth_token_env() -> String {
    "AGENT_OAUTH_TOKEN".into()
}
fn d_github_token_env() -> String {
    "GITHUB_TOKEN".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions (supervisor behavior)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Quiet period after an agent turn before the channel is torn down
    /// so the sprite can hibernate.
    #[serde(default = "d_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Outer timeout on sprite allocation during session init.
    #[serde(default = "d_allocate_timeout")]
    pub allocate_timeout_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: d_idle_timeout(),
            allocate_timeout_secs: d_allocate_timeout(),
        }
    }
}

fn d_idle_timeout() -> u64 {
    120
}
fn d_allocate_timeout() -> u64 {
    120
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OAuth (agent credential refresh)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthConfig {
    /// Provider token endpoint for `grant_type=refresh_token`.
    #[serde(default = "d_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "d_client_id")]
    pub client_id: String,
    /// Refresh this long before `expires_at`.
    #[serde(default = "d_refresh_buffer")]
    pub refresh_buffer_secs: u64,
    /// HTTP timeout on the refresh call.
    #[serde(default = "d_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

impl Default for OauthConfig {
    fn default() -> Self {
        Self {
            token_endpoint: d_token_endpoint(),
            client_id: d_client_id(),
            refresh_buffer_secs: d_refresh_buffer(),
            refresh_timeout_secs: d_refresh_timeout(),
        }
    }
}

fn d_token_endpoint() -> String {
    "https://auth.example.com/v1/oauth/token".into()
}
fn d_client_id() -> String {
    String::new()
}
fn d_refresh_buffer() -> u64 {
    300
}
fn d_refresh_timeout() -> u64 {
    30
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "d_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: d_db_path() }
    }
}

fn d_db_path() -> PathBuf {
    PathBuf::from("./data/spritedeck.db")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.server.port, 8384);
        assert_eq!(c.sessions.idle_timeout_secs, 120);
        assert_eq!(c.sessions.allocate_timeout_secs, 120);
        assert_eq!(c.oauth.refresh_buffer_secs, 300);
        assert_eq!(c.sprites.exec_timeout_secs, 60);
        assert_eq!(c.sprites.clone_timeout_secs, 300);
        assert_eq!(c.sprites.token_env, "SPRITE_TOKEN");
        assert_eq!(c.agent.binary, "agent");
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.server.host, "127.0.0.1");
        assert_eq!(c.sprites.default_sprite, "spritedeck");
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let c: Config = toml::from_str(
            r#"
            [sessions]
            idle_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(c.sessions.idle_timeout_secs, 30);
        assert_eq!(c.sessions.allocate_timeout_secs, 120);
    }

    #[test]
    fn validate_flags_empty_base_url() {
        let mut c = Config::default();
        c.sprites.base_url = String::new();
        let issues = c.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "sprites.base_url" && i.severity == ConfigSeverity::Error));
    }
}
