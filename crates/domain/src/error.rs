/// Shared error type used across all SpriteDeck crates.
///
/// The orchestration-facing variants (`RepoLocked`, `RepoNotFound`,
/// `CloneFailed`, `GitConfigFailed`, `RefreshFailed`, `NoTokenConfigured`)
/// are the typed reasons surfaced to session subscribers; everything else
/// is infrastructure plumbing.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("database: {0}")]
    Db(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("sprite API {status}: {message}")]
    SpriteApi { status: u16, message: String },

    #[error("repository {repo_id} is locked by task {holder}")]
    RepoLocked { repo_id: i64, holder: i64 },

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("clone failed: {0}")]
    CloneFailed(String),

    #[error("git config failed: {0}")]
    GitConfigFailed(String),

    #[error("sprite creation failed: {0}")]
    SpriteCreationFailed(String),

    #[error("prewarm failed: {0}")]
    PrewarmFailed(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("invalid refresh response: {0}")]
    InvalidRefreshResponse(String),

    #[error("no OAuth token configured")]
    NoTokenConfigured,

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures the user must resolve themselves (surfaced
    /// immediately, never retried locally).
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            Self::RepoLocked { .. } | Self::NoTokenConfigured | Self::RepoNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_locked_display_names_holder() {
        let e = Error::RepoLocked {
            repo_id: 7,
            holder: 3,
        };
        assert_eq!(e.to_string(), "repository 7 is locked by task 3");
    }

    #[test]
    fn user_actionable_classification() {
        assert!(Error::NoTokenConfigured.is_user_actionable());
        assert!(Error::RepoLocked {
            repo_id: 1,
            holder: 2
        }
        .is_user_actionable());
        assert!(!Error::Http("boom".into()).is_user_actionable());
        assert!(!Error::CloneFailed("x".into()).is_user_actionable());
    }
}
