//! Task records.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use sd_domain::error::{Error, Result};
use sd_domain::model::{Task, TaskStatus};

use crate::db::{db_err, parse_ts, ts, Database};

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<(i64, Option<String>, String, Option<i64>, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn build_task(
    (id, title, status, repo_id, created_at, updated_at): (
        i64,
        Option<String>,
        String,
        Option<i64>,
        String,
        String,
    ),
) -> Result<Task> {
    Ok(Task {
        id,
        title,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| Error::Db(format!("unknown task status {status:?}")))?,
        repo_id,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

const TASK_COLS: &str = "id, title, status, repo_id, created_at, updated_at";

impl Database {
    pub fn create_task(&self, title: Option<&str>, repo_id: Option<i64>) -> Result<Task> {
        let now = ts(Utc::now());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tasks (title, status, repo_id, created_at, updated_at)
             VALUES (?1, 'active', ?2, ?3, ?3)",
            params![title, repo_id, now],
        )
        .map_err(db_err)?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_task(id)?
            .ok_or_else(|| Error::Db("task vanished after insert".into()))
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"),
                params![id],
                row_to_task,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(build_task).transpose()
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLS} FROM tasks ORDER BY updated_at DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], row_to_task)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(build_task).collect()
    }

    pub fn set_task_status(&self, id: i64, status: TaskStatus) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(Utc::now()), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Delete a task and everything hanging off it: messages, execution
    /// sessions, and any repo lock it still holds.
    pub fn delete_task(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM messages WHERE task_id = ?1", params![id])
            .map_err(db_err)?;
        tx.execute(
            "DELETE FROM execution_sessions WHERE task_id = ?1",
            params![id],
        )
        .map_err(db_err)?;
        tx.execute(
            "UPDATE repos SET locked_by_task_id = NULL, locked_at = NULL
             WHERE locked_by_task_id = ?1",
            params![id],
        )
        .map_err(db_err)?;
        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }
}
