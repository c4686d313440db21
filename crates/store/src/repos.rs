//! Repo records and the DB-enforced repo lock.
//!
//! The lock row (`locked_by_task_id`, `locked_at`) is the only mutual
//! exclusion mechanism for repositories. Acquisition runs in an
//! `IMMEDIATE` transaction so check-then-set is atomic even with multiple
//! orchestrator processes on one database.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use sd_domain::error::{Error, Result};
use sd_domain::model::Repo;

use crate::db::{db_err, parse_ts_opt, ts, Database};

const REPO_COLS: &str =
    "id, remote_url, display_name, default_branch, last_used_at, locked_by_task_id, locked_at";

type RepoRaw = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    Option<String>,
);

fn row_to_repo(row: &Row<'_>) -> rusqlite::Result<RepoRaw> {
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

fn build_repo(
    (id, remote_url, display_name, default_branch, last_used_at, locked_by_task_id, locked_at): RepoRaw,
) -> Result<Repo> {
    Ok(Repo {
        id,
        remote_url,
        display_name,
        default_branch,
        last_used_at: parse_ts_opt(last_used_at)?,
        locked_by_task_id,
        locked_at: parse_ts_opt(locked_at)?,
    })
}

impl Database {
    /// Create the repo on first use, or update its branch/display name if
    /// the remote URL is already registered.
    pub fn upsert_repo(
        &self,
        remote_url: &str,
        display_name: &str,
        default_branch: &str,
    ) -> Result<Repo> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO repos (remote_url, display_name, default_branch)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(remote_url) DO UPDATE SET
                 display_name = ?2,
                 default_branch = ?3",
            params![remote_url, display_name, default_branch],
        )
        .map_err(db_err)?;
        let raw = conn
            .query_row(
                &format!("SELECT {REPO_COLS} FROM repos WHERE remote_url = ?1"),
                params![remote_url],
                row_to_repo,
            )
            .map_err(db_err)?;
        build_repo(raw)
    }

    pub fn get_repo(&self, id: i64) -> Result<Option<Repo>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {REPO_COLS} FROM repos WHERE id = ?1"),
                params![id],
                row_to_repo,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(build_repo).transpose()
    }

    pub fn list_repos(&self) -> Result<Vec<Repo>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {REPO_COLS} FROM repos ORDER BY display_name"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], row_to_repo)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(build_repo).collect()
    }

    pub fn touch_repo_used(&self, id: i64) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE repos SET last_used_at = ?1 WHERE id = ?2",
                params![ts(Utc::now()), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ── repo lock ────────────────────────────────────────────────────

    /// Acquire the exclusive lock on a repo for a task. Reentrant for the
    /// holder; any other holder yields [`Error::RepoLocked`].
    pub fn try_lock_repo(&self, repo_id: i64, task_id: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let holder: Option<i64> = tx
            .query_row(
                "SELECT locked_by_task_id FROM repos WHERE id = ?1",
                params![repo_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::RepoNotFound(format!("repo id {repo_id}")))?;

        match holder {
            None => {
                tx.execute(
                    "UPDATE repos SET locked_by_task_id = ?1, locked_at = ?2 WHERE id = ?3",
                    params![task_id, ts(Utc::now()), repo_id],
                )
                .map_err(db_err)?;
                tx.commit().map_err(db_err)?;
                tracing::debug!(repo_id, task_id, "repo lock acquired");
                Ok(())
            }
            Some(current) if current == task_id => {
                tx.commit().map_err(db_err)?;
                Ok(())
            }
            Some(current) => {
                tx.commit().map_err(db_err)?;
                Err(Error::RepoLocked {
                    repo_id,
                    holder: current,
                })
            }
        }
    }

    /// Compare-and-clear release. Idempotent: releasing a lock you do not
    /// hold is a no-op.
    pub fn unlock_repo(&self, repo_id: i64, task_id: i64) -> Result<()> {
        let changed = self
            .conn
            .lock()
            .execute(
                "UPDATE repos SET locked_by_task_id = NULL, locked_at = NULL
                 WHERE id = ?1 AND locked_by_task_id = ?2",
                params![repo_id, task_id],
            )
            .map_err(db_err)?;
        if changed > 0 {
            tracing::debug!(repo_id, task_id, "repo lock released");
        }
        Ok(())
    }

    /// Which task currently holds the lock, if any.
    pub fn locked_by(&self, repo_id: i64) -> Result<Option<i64>> {
        self.conn
            .lock()
            .query_row(
                "SELECT locked_by_task_id FROM repos WHERE id = ?1",
                params![repo_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
            .map(Option::flatten)
    }

    /// Startup recovery sweep: clear locks whose holders are not in the
    /// live set. With an empty live set this releases every lock left
    /// over from a crashed process.
    pub fn release_locks_except(&self, live_task_ids: &[i64]) -> Result<usize> {
        let placeholders = if live_task_ids.is_empty() {
            "SELECT NULL WHERE 0".to_owned()
        } else {
            live_task_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let sql = format!(
            "UPDATE repos SET locked_by_task_id = NULL, locked_at = NULL
             WHERE locked_by_task_id IS NOT NULL
               AND locked_by_task_id NOT IN ({placeholders})"
        );
        let released = self.conn.lock().execute(&sql, []).map_err(db_err)?;
        if released > 0 {
            tracing::info!(released, "released orphaned repo locks");
        }
        Ok(released)
    }
}
