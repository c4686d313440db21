//! Agent stream-JSON event parsing.
//!
//! The agent's stdout carries newline-delimited JSON records. Each
//! record's `type` field dispatches into [`AgentEvent`]; anything that is
//! not valid JSON surfaces as [`AgentEvent::Raw`] so a malformed line
//! never aborts the stream.

use serde::Serialize;
use serde_json::Value;

use crate::tool_result::extract_tool_result;

/// One tool invocation inside an assistant turn, in content order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// The typed internal event sum produced from the agent's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Opaque initialization info emitted once at agent startup.
    SystemInit { data: Value },

    /// A model turn: concatenated text plus ordered tool uses.
    AssistantMessage {
        text: String,
        tool_uses: Vec<ToolUse>,
    },

    /// A tool result extracted from a `user` record carrying
    /// `tool_use_result`.
    ToolResult {
        tool_use_id: String,
        stdout: String,
        stderr: String,
        is_error: bool,
    },

    /// End of one agent turn.
    MessageStop,

    /// A record with a `type` we do not model.
    Other { kind: String, data: Value },

    /// A line that was not a JSON record.
    Raw { text: String },
}

/// Parse one complete stdout line. Never fails: malformed input becomes
/// [`AgentEvent::Raw`].
pub fn parse_line(line: &str) -> AgentEvent {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable agent output line");
            return AgentEvent::Raw {
                text: line.to_owned(),
            };
        }
    };

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return AgentEvent::Raw {
            text: line.to_owned(),
        };
    };

    match kind {
        "system" => AgentEvent::SystemInit { data: value },
        "assistant" => parse_assistant(&value),
        "user" => parse_user(&value),
        "message_stop" => AgentEvent::MessageStop,
        other => AgentEvent::Other {
            kind: other.to_owned(),
            data: value.clone(),
        },
    }
}

/// Serialize a user turn as the one-line stream-JSON record the agent
/// reads on stdin (trailing newline included).
pub fn user_turn_line(content: &str) -> String {
    let record = serde_json::json!({
        "type": "user",
        "message": {"role": "user", "content": content},
    });
    let mut line = record.to_string();
    line.push('\n');
    line
}

fn content_array(value: &Value) -> Option<&Vec<Value>> {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| value.get("content"))
        .and_then(Value::as_array)
}

fn parse_assistant(value: &Value) -> AgentEvent {
    let mut text = String::new();
    let mut tool_uses = Vec::new();

    if let Some(content) = content_array(value) {
        for entry in content {
            match entry.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = entry.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    tool_uses.push(ToolUse {
                        id: entry
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        name: entry
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        input: entry.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
    }

    AgentEvent::AssistantMessage { text, tool_uses }
}

fn parse_user(value: &Value) -> AgentEvent {
    let Some(payload) = value.get("tool_use_result") else {
        // A user record without a tool result is not one of ours.
        return AgentEvent::Other {
            kind: "user".to_owned(),
            data: value.clone(),
        };
    };

    let first_entry = content_array(value).and_then(|c| c.first());
    let tool_use_id = first_entry
        .and_then(|e| e.get("tool_use_id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let extracted = extract_tool_result(payload);
    // The content entry may carry the error flag instead of the payload.
    let entry_error = first_entry
        .and_then(|e| e.get("is_error"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    AgentEvent::ToolResult {
        tool_use_id,
        stdout: extracted.stdout,
        stderr: extracted.stderr,
        is_error: extracted.is_error || entry_error,
    }
}
