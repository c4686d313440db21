use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use sd_domain::error::{Error, Result};

/// SQLite-backed store. All access serializes through the connection
/// mutex; callers never hold it across an await point (every method here
/// is synchronous and fast).
pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(db_err)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        tracing::info!(path = %db_path.display(), "database ready");
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(db_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS repos (
                    id INTEGER PRIMARY KEY,
                    remote_url TEXT NOT NULL UNIQUE,
                    display_name TEXT NOT NULL UNIQUE,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    last_used_at TEXT,
                    locked_by_task_id INTEGER,
                    locked_at TEXT
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY,
                    title TEXT,
                    status TEXT NOT NULL DEFAULT 'active',
                    repo_id INTEGER REFERENCES repos(id),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS execution_sessions (
                    id INTEGER PRIMARY KEY,
                    task_id INTEGER NOT NULL REFERENCES tasks(id),
                    sprite_name TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'agent',
                    status TEXT NOT NULL DEFAULT 'started',
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}'
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY,
                    task_id INTEGER NOT NULL REFERENCES tasks(id),
                    execution_session_id INTEGER REFERENCES execution_sessions(id),
                    kind TEXT NOT NULL,
                    content TEXT,
                    tool_data TEXT,
                    inserted_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS oauth_tokens (
                    id INTEGER PRIMARY KEY,
                    user_id INTEGER,
                    access_token TEXT NOT NULL,
                    refresh_token TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    scopes TEXT,
                    subscription_tier TEXT
                );

                -- At most one execution session per task may be running.
                CREATE UNIQUE INDEX IF NOT EXISTS idx_exec_one_started
                    ON execution_sessions(task_id) WHERE status = 'started';

                -- The token row is singleton per user_id, NULL included.
                CREATE UNIQUE INDEX IF NOT EXISTS idx_oauth_user
                    ON oauth_tokens(COALESCE(user_id, -1));

                CREATE INDEX IF NOT EXISTS idx_messages_task
                    ON messages(task_id, id);
                CREATE INDEX IF NOT EXISTS idx_exec_task
                    ON execution_sessions(task_id);
                "#,
            )
            .map_err(db_err)?;
        Ok(())
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Db(e.to_string())
}

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Db(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_dirs_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/spritedeck.db");

        let db = Database::open(&path).unwrap();
        let task = db.create_task(Some("persisted"), None).unwrap();
        drop(db);

        let db = Database::open(&path).unwrap();
        let fetched = db.get_task(task.id).unwrap().unwrap();
        assert_eq!(fetched.title.as_deref(), Some("persisted"));
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        assert_eq!(parse_ts(&ts(now)).unwrap(), now);
        assert!(parse_ts("not a timestamp").is_err());
        assert_eq!(parse_ts_opt(None).unwrap(), None);
    }
}
