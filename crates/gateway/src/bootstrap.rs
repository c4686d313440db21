//! AppState construction extracted from `main.rs` so tests can boot the
//! runtime without an HTTP listener.

use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};

use sd_domain::config::{Config, ConfigSeverity};
use sd_sprites::SpriteClient;
use sd_store::Database;

use crate::runtime::allocator::{self, AllocatorDeps};
use crate::runtime::registry::SupervisorRegistry;
use crate::runtime::token::TokenManager;
use crate::state::AppState;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Store ────────────────────────────────────────────────────────
    let store = Arc::new(
        Database::open(&config.database.path).context("opening database")?,
    );

    // Recovery sweep: no supervisor is running yet, so any held repo
    // lock is an orphan from a previous process.
    let released = store
        .release_locks_except(&[])
        .context("repo lock recovery sweep")?;
    if released > 0 {
        tracing::warn!(released, "recovered orphaned repo locks from previous run");
    }

    // ── Sprite client ────────────────────────────────────────────────
    let sprite_token = std::env::var(&config.sprites.token_env)
        .ok()
        .filter(|t| !t.is_empty())
        .with_context(|| format!("env var {} is required", config.sprites.token_env))?;
    let sprites = Arc::new(
        SpriteClient::new(&config.sprites.base_url, &sprite_token)
            .context("building sprite client")?,
    );
    tracing::info!(base_url = %config.sprites.base_url, "sprite client ready");

    // ── Token manager ────────────────────────────────────────────────
    let legacy_token = std::env::var(&config.agent.oauth_token_env)
        .ok()
        .filter(|t| !t.is_empty());
    let tokens = Arc::new(
        TokenManager::new(store.clone(), &config.oauth, legacy_token)
            .context("building token manager")?,
    );
    tracing::info!("token manager ready");

    // ── GitHub token (optional) ──────────────────────────────────────
    let github_token = std::env::var(&config.agent.github_token_env)
        .ok()
        .filter(|t| !t.is_empty());
    if github_token.is_some() {
        tracing::info!("GitHub token present; private clones enabled");
    }

    // ── Allocator ────────────────────────────────────────────────────
    let allocator = allocator::spawn(AllocatorDeps {
        store: store.clone(),
        sprites: sprites.clone(),
        tokens: tokens.clone(),
        config: config.clone(),
        github_token: github_token.clone(),
    });
    tracing::info!(sprite = %config.sprites.default_sprite, "allocator ready");

    // ── Supervisor registry ──────────────────────────────────────────
    let registry = Arc::new(SupervisorRegistry::new());

    // ── Service password ─────────────────────────────────────────────
    let password_hash = match std::env::var(&config.server.password_env) {
        Ok(p) if !p.is_empty() => Some(Sha256::digest(p.as_bytes()).to_vec()),
        _ => {
            tracing::warn!(
                env = %config.server.password_env,
                "no service password set; API is open (dev mode)"
            );
            None
        }
    };

    Ok(AppState {
        config,
        store,
        sprites,
        tokens,
        allocator,
        registry,
        password_hash,
        github_token,
    })
}
