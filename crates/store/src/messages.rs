//! The conversation store: append-only messages with a bounded in-place
//! mutation surface (streaming assistant appends, tool-result back-patch).

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use sd_domain::error::{Error, Result};
use sd_domain::model::{Message, MessageKind};

use crate::db::{db_err, parse_ts, ts, Database};

/// Parameters for [`Database::create_message`].
#[derive(Debug, Clone)]
pub struct CreateMessage {
    pub task_id: i64,
    pub execution_session_id: Option<i64>,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub tool_data: Option<Value>,
}

const MESSAGE_COLS: &str =
    "id, task_id, execution_session_id, kind, content, tool_data, inserted_at";

type MessageRaw = (
    i64,
    i64,
    Option<i64>,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRaw> {
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

fn build_message(
    (id, task_id, execution_session_id, kind, content, tool_data, inserted_at): MessageRaw,
) -> Result<Message> {
    Ok(Message {
        id,
        task_id,
        execution_session_id,
        kind: MessageKind::parse(&kind)
            .ok_or_else(|| Error::Db(format!("unknown message kind {kind:?}")))?,
        content,
        tool_data: tool_data
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        inserted_at: parse_ts(&inserted_at)?,
    })
}

impl Database {
    pub fn create_message(&self, msg: CreateMessage) -> Result<Message> {
        if msg.kind == MessageKind::ToolCall {
            let has_id = msg
                .tool_data
                .as_ref()
                .and_then(|d| d.get("tool_use_id"))
                .and_then(Value::as_str)
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            if !has_id {
                return Err(Error::Db(
                    "tool_call messages require tool_data.tool_use_id".into(),
                ));
            }
        }

        let tool_data = msg.tool_data.map(|d| d.to_string());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages
                 (task_id, execution_session_id, kind, content, tool_data, inserted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                msg.task_id,
                msg.execution_session_id,
                msg.kind.as_str(),
                msg.content,
                tool_data,
                ts(Utc::now()),
            ],
        )
        .map_err(db_err)?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_message(id)?
            .ok_or_else(|| Error::Db("message vanished after insert".into()))
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(build_message).transpose()
    }

    /// Streaming append: `content := (content ?? "") ++ text`. Only valid
    /// for assistant messages whose execution session is still running.
    pub fn append_to_message(&self, id: i64, text: &str) -> Result<()> {
        let changed = self
            .conn
            .lock()
            .execute(
                "UPDATE messages SET content = COALESCE(content, '') || ?1
                 WHERE id = ?2
                   AND kind = 'assistant'
                   AND execution_session_id IN
                       (SELECT id FROM execution_sessions WHERE status = 'started')",
                params![text, id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::Db(format!(
                "message {id} is not an appendable assistant message"
            )));
        }
        Ok(())
    }

    /// Back-patch a tool result onto its call record: merges `output` and
    /// `is_error` into `tool_data`. Only valid while the owning execution
    /// session is still running.
    pub fn update_tool_result(&self, id: i64, output: &str, is_error: bool) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let raw: Option<Option<String>> = tx
            .query_row(
                "SELECT tool_data FROM messages
                 WHERE id = ?1
                   AND execution_session_id IN
                       (SELECT id FROM execution_sessions WHERE status = 'started')",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(raw) = raw else {
            return Err(Error::Db(format!(
                "message {id} is not patchable (missing or session ended)"
            )));
        };

        let mut data: Value = raw
            .map(|r| serde_json::from_str(&r))
            .transpose()?
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let Some(map) = data.as_object_mut() {
            map.insert("output".into(), Value::String(output.to_owned()));
            map.insert("is_error".into(), Value::Bool(is_error));
        }

        tx.execute(
            "UPDATE messages SET tool_data = ?1 WHERE id = ?2",
            params![data.to_string(), id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Find the tool_call message a result should be patched onto.
    pub fn find_tool_message(&self, task_id: i64, tool_use_id: &str) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLS} FROM messages
                     WHERE task_id = ?1
                       AND kind = 'tool_call'
                       AND json_extract(tool_data, '$.tool_use_id') = ?2
                     ORDER BY id DESC LIMIT 1"
                ),
                params![task_id, tool_use_id],
                row_to_message,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(build_message).transpose()
    }

    /// Messages for a task in insertion order, bounded.
    pub fn list_messages(&self, task_id: i64, limit: usize) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages
                 WHERE task_id = ?1 ORDER BY id LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![task_id, limit as i64], row_to_message)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(build_message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sd_domain::model::ExecutionSessionStatus;
    use serde_json::json;

    struct Fixture {
        db: Database,
        task_id: i64,
        session_id: i64,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let task = db.create_task(None, None).unwrap();
        let session = db
            .start_execution_session(task.id, "sprite-1", "agent")
            .unwrap();
        Fixture {
            task_id: task.id,
            session_id: session.id,
            db,
        }
    }

    fn assistant(f: &Fixture, content: &str) -> Message {
        f.db.create_message(CreateMessage {
            task_id: f.task_id,
            execution_session_id: Some(f.session_id),
            kind: MessageKind::Assistant,
            content: Some(content.into()),
            tool_data: None,
        })
        .unwrap()
    }

    #[test]
    fn create_and_list_in_insertion_order() {
        let f = fixture();
        assistant(&f, "one");
        assistant(&f, "two");
        let msgs = f.db.list_messages(f.task_id, 10).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content.as_deref(), Some("one"));
        assert_eq!(msgs[1].content.as_deref(), Some("two"));
    }

    #[test]
    fn list_respects_limit() {
        let f = fixture();
        for i in 0..5 {
            assistant(&f, &format!("m{i}"));
        }
        assert_eq!(f.db.list_messages(f.task_id, 3).unwrap().len(), 3);
    }

    #[test]
    fn tool_call_requires_tool_use_id() {
        let f = fixture();
        let err = f.db.create_message(CreateMessage {
            task_id: f.task_id,
            execution_session_id: Some(f.session_id),
            kind: MessageKind::ToolCall,
            content: None,
            tool_data: Some(json!({"name": "Bash"})),
        });
        assert!(err.is_err());
    }

    #[test]
    fn append_streams_into_assistant_content() {
        let f = fixture();
        let msg = assistant(&f, "Hel");
        f.db.append_to_message(msg.id, "lo.").unwrap();
        let got = f.db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(got.content.as_deref(), Some("Hello."));
    }

    #[test]
    fn append_rejected_after_session_ends() {
        let f = fixture();
        let msg = assistant(&f, "x");
        f.db.complete_execution_session(f.session_id, ExecutionSessionStatus::Completed)
            .unwrap();
        assert!(f.db.append_to_message(msg.id, "y").is_err());
    }

    #[test]
    fn append_rejected_for_non_assistant() {
        let f = fixture();
        let msg = f
            .db
            .create_message(CreateMessage {
                task_id: f.task_id,
                execution_session_id: Some(f.session_id),
                kind: MessageKind::User,
                content: Some("hi".into()),
                tool_data: None,
            })
            .unwrap();
        assert!(f.db.append_to_message(msg.id, "!").is_err());
    }

    #[test]
    fn tool_result_back_patch() {
        let f = fixture();
        let call = f
            .db
            .create_message(CreateMessage {
                task_id: f.task_id,
                execution_session_id: Some(f.session_id),
                kind: MessageKind::ToolCall,
                content: None,
                tool_data: Some(json!({
                    "tool_use_id": "u1",
                    "name": "Bash",
                    "input": {"command": "ls"},
                })),
            })
            .unwrap();

        let found = f.db.find_tool_message(f.task_id, "u1").unwrap().unwrap();
        assert_eq!(found.id, call.id);

        f.db.update_tool_result(call.id, "a\nb\n", false).unwrap();
        let patched = f.db.get_message(call.id).unwrap().unwrap();
        let data = patched.tool_data.unwrap();
        assert_eq!(data["output"], "a\nb\n");
        assert_eq!(data["is_error"], false);
        // The original call fields survive the merge.
        assert_eq!(data["name"], "Bash");
        assert_eq!(data["tool_use_id"], "u1");
    }

    #[test]
    fn back_patch_rejected_after_session_ends() {
        let f = fixture();
        let call = f
            .db
            .create_message(CreateMessage {
                task_id: f.task_id,
                execution_session_id: Some(f.session_id),
                kind: MessageKind::ToolCall,
                content: None,
                tool_data: Some(json!({"tool_use_id": "u1"})),
            })
            .unwrap();
        f.db.complete_execution_session(f.session_id, ExecutionSessionStatus::Failed)
            .unwrap();
        assert!(f.db.update_tool_result(call.id, "late", false).is_err());
    }

    #[test]
    fn find_tool_message_misses_cleanly() {
        let f = fixture();
        assert!(f.db.find_tool_message(f.task_id, "nope").unwrap().is_none());
    }
}
