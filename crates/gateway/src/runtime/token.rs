//! OAuth token manager — the singleton owner of the agent's credential.
//!
//! `get_access_token` hands out a currently-valid access token,
//! refreshing proactively when the stored expiry is within the refresh
//! buffer. Refresh is serialized through the state mutex: a second caller
//! arriving mid-refresh waits and receives the same rotated token rather
//! than triggering a duplicate refresh.
//!
//! After a successful refresh the new token is written to the database
//! before being returned; if that write fails the in-memory token is
//! still handed out (the agent must not stall on a DB outage) and a
//! warning is logged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use sd_domain::config::OauthConfig;
use sd_domain::error::{Error, Result};
use sd_domain::model::OauthToken;
use sd_store::Database;

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

pub struct TokenManager {
    http: Client,
    store: Arc<Database>,
    endpoint: String,
    client_id: String,
    refresh_buffer: chrono::Duration,
    /// Legacy fallback access token from the environment, used only when
    /// the database holds no row.
    legacy_token: Option<String>,
    /// In-memory copy of the live token. The mutex also serializes
    /// refresh: at most one is ever in flight.
    state: Mutex<Option<OauthToken>>,
}

impl TokenManager {
    pub fn new(
        store: Arc<Database>,
        oauth: &OauthConfig,
        legacy_token: Option<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(oauth.refresh_timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            http,
            store,
            endpoint: oauth.token_endpoint.clone(),
            client_id: oauth.client_id.clone(),
            refresh_buffer: chrono::Duration::seconds(oauth.refresh_buffer_secs as i64),
            legacy_token,
            state: Mutex::new(None),
        })
    }

    /// A currently-valid access token, refreshing first if needed.
    pub async fn get_access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;

        if state.is_none() {
            *state = self.store.get_token()?;
        }

        match state.as_ref() {
            Some(token) if token.needs_refresh(self.refresh_buffer) => {
                let refreshed = self.refresh(token).await?;
                let access = refreshed.access_token.clone();
                *state = Some(refreshed);
                Ok(access)
            }
            Some(token) => Ok(token.access_token.clone()),
            None => match &self.legacy_token {
                Some(tok) => {
                    tracing::warn!("no OAuth token in database, using legacy env token");
                    Ok(tok.clone())
                }
                None => Err(Error::NoTokenConfigured),
            },
        }
    }

    /// Unconditional refresh.
    pub async fn force_refresh(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = self.store.get_token()?;
        }
        let Some(token) = state.as_ref() else {
            return Err(Error::NoTokenConfigured);
        };
        let refreshed = self.refresh(token).await?;
        let access = refreshed.access_token.clone();
        *state = Some(refreshed);
        Ok(access)
    }

    /// Upsert the singleton token row (called from the seed endpoint).
    pub async fn seed(
        &self,
        access_token: &str,
        refresh_token: &str,
        expires_at_unix_ms: i64,
        scopes: Option<&str>,
        subscription_tier: Option<&str>,
    ) -> Result<()> {
        let expires_at = DateTime::<Utc>::from_timestamp_millis(expires_at_unix_ms)
            .ok_or_else(|| Error::Other(format!("bad expires_at {expires_at_unix_ms}")))?;
        let row = self.store.upsert_token(
            access_token,
            refresh_token,
            expires_at,
            scopes,
            subscription_tier,
        )?;
        *self.state.lock().await = Some(row);
        tracing::info!("OAuth token seeded");
        Ok(())
    }

    /// One refresh round-trip. The provider occasionally serves a
    /// transient failure, so a single immediate retry is built in; both
    /// failing keeps the old token in place and surfaces the error.
    async fn refresh(&self, current: &OauthToken) -> Result<OauthToken> {
        let mut last_err = None;
        for attempt in 0..2 {
            match self.refresh_once(current).await {
                Ok(token) => {
                    if attempt > 0 {
                        tracing::info!("token refresh succeeded on retry");
                    }
                    return Ok(token);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "token refresh attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(Error::RefreshFailed("unknown".into())))
    }

    async fn refresh_once(&self, current: &OauthToken) -> Result<OauthToken> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": current.refresh_token,
                "client_id": self.client_id,
            }))
            .send()
            .await
            .map_err(|e| Error::RefreshFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::RefreshFailed(format!("provider returned {status}")));
        }

        let parsed: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| Error::InvalidRefreshResponse(e.to_string()))?;

        let expires_at = Utc::now() + chrono::Duration::seconds(parsed.expires_in as i64);
        // Token rotation: a refresh_token in the response replaces ours.
        let refresh_token = parsed
            .refresh_token
            .unwrap_or_else(|| current.refresh_token.clone());

        // Durability first; on a DB outage hand out the in-memory token.
        match self.store.upsert_token(
            &parsed.access_token,
            &refresh_token,
            expires_at,
            current.scopes.as_deref(),
            current.subscription_tier.as_deref(),
        ) {
            Ok(row) => Ok(row),
            Err(e) => {
                tracing::warn!(error = %e, "token refreshed but DB write failed; continuing in memory");
                Ok(OauthToken {
                    id: current.id,
                    user_id: current.user_id,
                    access_token: parsed.access_token,
                    refresh_token,
                    expires_at,
                    scopes: current.scopes.clone(),
                    subscription_tier: current.subscription_tier.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oauth_config(server: &MockServer) -> OauthConfig {
        OauthConfig {
            token_endpoint: format!("{}/v1/oauth/token", server.uri()),
            client_id: "client-1".into(),
            refresh_buffer_secs: 300,
            refresh_timeout_secs: 5,
        }
    }

    async fn manager_with_token(
        server: &MockServer,
        expires_in_secs: i64,
    ) -> (Arc<Database>, TokenManager) {
        let store = Arc::new(Database::open_in_memory().unwrap());
        store
            .upsert_token(
                "old-access",
                "old-refresh",
                Utc::now() + chrono::Duration::seconds(expires_in_secs),
                None,
                None,
            )
            .unwrap();
        let mgr = TokenManager::new(store.clone(), &oauth_config(server), None).unwrap();
        (store, mgr)
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let server = MockServer::start().await;
        let (_store, mgr) = manager_with_token(&server, 3600).await;
        assert_eq!(mgr.get_access_token().await.unwrap(), "old-access");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn near_expiry_triggers_refresh_and_rotation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .and(body_partial_json(serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": "old-refresh",
                "client_id": "client-1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600,
                "token_type": "Bearer",
            })))
            .expect(1)
            .mount(&server)
            .await;

        // 60s left with a 5-minute buffer: must refresh.
        let (store, mgr) = manager_with_token(&server, 60).await;
        assert_eq!(mgr.get_access_token().await.unwrap(), "new-access");

        // Rotation persisted.
        let row = store.get_token().unwrap().unwrap();
        assert_eq!(row.access_token, "new-access");
        assert_eq!(row.refresh_token, "new-refresh");
    }

    #[tokio::test]
    async fn missing_refresh_token_in_response_keeps_old_one() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let (store, mgr) = manager_with_token(&server, 10).await;
        mgr.get_access_token().await.unwrap();
        assert_eq!(store.get_token().unwrap().unwrap().refresh_token, "old-refresh");
    }

    #[tokio::test]
    async fn transient_failure_then_success_refreshes_once() {
        let server = MockServer::start().await;
        // First attempt: 401. Second: 200. Exactly two calls expected.
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "retried-access",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (_store, mgr) = manager_with_token(&server, 10).await;
        assert_eq!(mgr.get_access_token().await.unwrap(), "retried-access");
    }

    #[tokio::test]
    async fn refresh_failure_keeps_old_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (store, mgr) = manager_with_token(&server, 10).await;
        assert!(matches!(
            mgr.get_access_token().await,
            Err(Error::RefreshFailed(_))
        ));
        // The stored token is untouched; a later retry may still succeed.
        assert_eq!(store.get_token().unwrap().unwrap().access_token, "old-access");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "access_token": "shared-access",
                        "expires_in": 3600,
                    }))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (_store, mgr) = manager_with_token(&server, 10).await;
        let mgr = Arc::new(mgr);
        let a = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.get_access_token().await.unwrap() })
        };
        let b = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.get_access_token().await.unwrap() })
        };
        assert_eq!(a.await.unwrap(), "shared-access");
        assert_eq!(b.await.unwrap(), "shared-access");
    }

    #[tokio::test]
    async fn no_token_yields_typed_error() {
        let server = MockServer::start().await;
        let store = Arc::new(Database::open_in_memory().unwrap());
        let mgr = TokenManager::new(store, &oauth_config(&server), None).unwrap();
        assert!(matches!(
            mgr.get_access_token().await,
            Err(Error::NoTokenConfigured)
        ));
    }

    #[tokio::test]
    async fn legacy_env_token_is_the_fallback() {
        let server = MockServer::start().await;
        let store = Arc::new(Database::open_in_memory().unwrap());
        let mgr =
            TokenManager::new(store, &oauth_config(&server), Some("legacy-tok".into())).unwrap();
        assert_eq!(mgr.get_access_token().await.unwrap(), "legacy-tok");
    }

    #[tokio::test]
    async fn seed_upserts_and_serves() {
        let server = MockServer::start().await;
        let store = Arc::new(Database::open_in_memory().unwrap());
        let mgr = TokenManager::new(store.clone(), &oauth_config(&server), None).unwrap();

        let expires = (Utc::now() + chrono::Duration::hours(2)).timestamp_millis();
        mgr.seed("seeded", "seeded-refresh", expires, Some("inference"), Some("max"))
            .await
            .unwrap();

        assert_eq!(mgr.get_access_token().await.unwrap(), "seeded");
        let row = store.get_token().unwrap().unwrap();
        assert_eq!(row.subscription_tier.as_deref(), Some("max"));
    }
}
