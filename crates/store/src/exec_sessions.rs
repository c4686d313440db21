//! Execution sessions — one row per contiguous agent run.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use sd_domain::error::{Error, Result};
use sd_domain::model::{ExecutionSession, ExecutionSessionStatus};

use crate::db::{db_err, parse_ts, parse_ts_opt, ts, Database};

const SESSION_COLS: &str =
    "id, task_id, sprite_name, kind, status, started_at, ended_at, metadata";

type SessionRaw = (
    i64,
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
);

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn build_session(
    (id, task_id, sprite_name, kind, status, started_at, ended_at, metadata): SessionRaw,
) -> Result<ExecutionSession> {
    Ok(ExecutionSession {
        id,
        task_id,
        sprite_name,
        kind,
        status: ExecutionSessionStatus::parse(&status)
            .ok_or_else(|| Error::Db(format!("unknown session status {status:?}")))?,
        started_at: parse_ts(&started_at)?,
        ended_at: parse_ts_opt(ended_at)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

impl Database {
    /// Open a new execution session. The partial unique index rejects a
    /// second `started` row for the same task, so the caller must close
    /// the previous session first.
    pub fn start_execution_session(
        &self,
        task_id: i64,
        sprite_name: &str,
        kind: &str,
    ) -> Result<ExecutionSession> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO execution_sessions (task_id, sprite_name, kind, status, started_at)
             VALUES (?1, ?2, ?3, 'started', ?4)",
            params![task_id, sprite_name, kind, ts(Utc::now())],
        )
        .map_err(db_err)?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_execution_session(id)?
            .ok_or_else(|| Error::Db("execution session vanished after insert".into()))
    }

    /// Terminate a session. Idempotent: a row that already reached a
    /// terminal status keeps its original status and `ended_at`.
    pub fn complete_execution_session(
        &self,
        id: i64,
        status: ExecutionSessionStatus,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::Db(
                "complete_execution_session requires a terminal status".into(),
            ));
        }
        self.conn
            .lock()
            .execute(
                "UPDATE execution_sessions SET status = ?1, ended_at = ?2
                 WHERE id = ?3 AND status = 'started'",
                params![status.as_str(), ts(Utc::now()), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_execution_session(&self, id: i64) -> Result<Option<ExecutionSession>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {SESSION_COLS} FROM execution_sessions WHERE id = ?1"),
                params![id],
                row_to_session,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(build_session).transpose()
    }

    /// The task's currently-running session, if any.
    pub fn started_execution_session(&self, task_id: i64) -> Result<Option<ExecutionSession>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLS} FROM execution_sessions
                     WHERE task_id = ?1 AND status = 'started'"
                ),
                params![task_id],
                row_to_session,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(build_session).transpose()
    }

    pub fn list_execution_sessions(&self, task_id: i64) -> Result<Vec<ExecutionSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLS} FROM execution_sessions
                 WHERE task_id = ?1 ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![task_id], row_to_session)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(build_session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_task() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let task = db.create_task(None, None).unwrap();
        (db, task.id)
    }

    #[test]
    fn started_session_has_no_end() {
        let (db, task_id) = db_with_task();
        let s = db.start_execution_session(task_id, "sprite-1", "agent").unwrap();
        assert_eq!(s.status, ExecutionSessionStatus::Started);
        assert!(s.ended_at.is_none());
        assert_eq!(
            db.started_execution_session(task_id).unwrap().unwrap().id,
            s.id
        );
    }

    #[test]
    fn second_started_session_is_rejected() {
        let (db, task_id) = db_with_task();
        db.start_execution_session(task_id, "sprite-1", "agent").unwrap();
        assert!(db
            .start_execution_session(task_id, "sprite-1", "agent")
            .is_err());
    }

    #[test]
    fn completion_sets_ended_at_once() {
        let (db, task_id) = db_with_task();
        let s = db.start_execution_session(task_id, "sprite-1", "agent").unwrap();

        db.complete_execution_session(s.id, ExecutionSessionStatus::Completed)
            .unwrap();
        let done = db.get_execution_session(s.id).unwrap().unwrap();
        assert_eq!(done.status, ExecutionSessionStatus::Completed);
        let first_end = done.ended_at.unwrap();

        // A second completion with a different status does not touch the row.
        db.complete_execution_session(s.id, ExecutionSessionStatus::Failed)
            .unwrap();
        let still = db.get_execution_session(s.id).unwrap().unwrap();
        assert_eq!(still.status, ExecutionSessionStatus::Completed);
        assert_eq!(still.ended_at.unwrap(), first_end);
    }

    #[test]
    fn completing_with_started_is_an_error() {
        let (db, task_id) = db_with_task();
        let s = db.start_execution_session(task_id, "sprite-1", "agent").unwrap();
        assert!(db
            .complete_execution_session(s.id, ExecutionSessionStatus::Started)
            .is_err());
    }

    #[test]
    fn new_session_allowed_after_previous_ends() {
        let (db, task_id) = db_with_task();
        let s1 = db.start_execution_session(task_id, "sprite-1", "agent").unwrap();
        db.complete_execution_session(s1.id, ExecutionSessionStatus::Interrupted)
            .unwrap();
        let s2 = db.start_execution_session(task_id, "sprite-1", "agent").unwrap();
        assert_ne!(s1.id, s2.id);
        assert_eq!(db.list_execution_sessions(task_id).unwrap().len(), 2);
    }
}
