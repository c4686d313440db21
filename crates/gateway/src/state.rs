use std::sync::Arc;

use sd_domain::config::Config;
use sd_sprites::SpriteClient;
use sd_store::Database;

use crate::runtime::allocator::AllocatorHandle;
use crate::runtime::registry::SupervisorRegistry;
use crate::runtime::token::TokenManager;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, store, sprite client, token manager
/// - **Runtime** — allocator handle, supervisor registry
/// - **Security (startup-computed)** — password hash, forwarded GitHub token
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub store: Arc<Database>,
    pub sprites: Arc<SpriteClient>,
    pub tokens: Arc<TokenManager>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub allocator: AllocatorHandle,
    pub registry: Arc<SupervisorRegistry>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the service password (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub password_hash: Option<Vec<u8>>,
    /// Optional GitHub token forwarded into agent processes.
    pub github_token: Option<String>,
}
