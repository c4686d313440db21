//! The singleton OAuth token row.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use sd_domain::error::{Error, Result};
use sd_domain::model::OauthToken;

use crate::db::{db_err, parse_ts, ts, Database};

const TOKEN_COLS: &str =
    "id, user_id, access_token, refresh_token, expires_at, scopes, subscription_tier";

type TokenRaw = (
    i64,
    Option<i64>,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn row_to_token(row: &Row<'_>) -> rusqlite::Result<TokenRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn build_token(
    (id, user_id, access_token, refresh_token, expires_at, scopes, subscription_tier): TokenRaw,
) -> Result<OauthToken> {
    Ok(OauthToken {
        id,
        user_id,
        access_token,
        refresh_token,
        expires_at: parse_ts(&expires_at)?,
        scopes,
        subscription_tier,
    })
}

impl Database {
    /// The global token row (`user_id IS NULL`), if one has been seeded.
    pub fn get_token(&self) -> Result<Option<OauthToken>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {TOKEN_COLS} FROM oauth_tokens WHERE user_id IS NULL"),
                [],
                row_to_token,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(build_token).transpose()
    }

    /// Upsert the global token row. Called on seed and after every
    /// successful refresh (token rotation included).
    pub fn upsert_token(
        &self,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
        scopes: Option<&str>,
        subscription_tier: Option<&str>,
    ) -> Result<OauthToken> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let updated = tx
            .execute(
                "UPDATE oauth_tokens
                 SET access_token = ?1, refresh_token = ?2, expires_at = ?3,
                     scopes = COALESCE(?4, scopes),
                     subscription_tier = COALESCE(?5, subscription_tier)
                 WHERE user_id IS NULL",
                params![access_token, refresh_token, ts(expires_at), scopes, subscription_tier],
            )
            .map_err(db_err)?;
        if updated == 0 {
            tx.execute(
                "INSERT INTO oauth_tokens
                     (user_id, access_token, refresh_token, expires_at, scopes, subscription_tier)
                 VALUES (NULL, ?1, ?2, ?3, ?4, ?5)",
                params![access_token, refresh_token, ts(expires_at), scopes, subscription_tier],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        drop(conn);

        self.get_token()?
            .ok_or_else(|| Error::Db("token vanished after upsert".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_token_until_seeded() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_token().unwrap().is_none());
    }

    #[test]
    fn upsert_stays_singleton() {
        let db = Database::open_in_memory().unwrap();
        let exp = Utc::now() + chrono::Duration::hours(1);

        let first = db
            .upsert_token("acc1", "ref1", exp, Some("inference"), Some("pro"))
            .unwrap();
        let second = db.upsert_token("acc2", "ref2", exp, None, None).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.access_token, "acc2");
        assert_eq!(second.refresh_token, "ref2");
        // COALESCE keeps the previously-stored metadata.
        assert_eq!(second.scopes.as_deref(), Some("inference"));
        assert_eq!(second.subscription_tier.as_deref(), Some("pro"));
    }

    #[test]
    fn expires_at_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let exp = Utc::now() + chrono::Duration::minutes(30);
        let tok = db.upsert_token("a", "r", exp, None, None).unwrap();
        // RFC 3339 keeps sub-second precision.
        assert_eq!(tok.expires_at, exp);
    }
}
