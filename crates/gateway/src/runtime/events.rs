//! Session events published to UI subscribers.
//!
//! Every supervisor owns a `broadcast::Sender<SessionEvent>`; the session
//! WebSocket forwards these as JSON. Within one execution session the
//! publish order matches the agent's emit order.

use serde::Serialize;
use serde_json::Value;

use sd_domain::model::ExecutionSessionStatus;

/// Supervisor status as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    StartingAgent,
    Ready,
    Processing,
    Idle,
    Disconnected,
    Error,
    Stopped,
}

/// Events emitted over the per-task broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status {
        status: SessionStatus,
    },

    /// Assistant prose for the current turn.
    AgentText {
        text: String,
    },

    /// The agent invoked a tool.
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
    },

    /// A tool result was back-patched onto its call record.
    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
    },

    /// One agent turn finished.
    AgentDone,

    /// A user-facing error (plus a status transition).
    AgentError {
        text: String,
    },

    ExecutionSessionStarted {
        id: i64,
    },

    ExecutionSessionEnded {
        id: i64,
        status: ExecutionSessionStatus,
    },

    /// Output that was not a structured event line.
    Raw {
        text: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_tagged() {
        let v = serde_json::to_value(SessionEvent::Status {
            status: SessionStatus::StartingAgent,
        })
        .unwrap();
        assert_eq!(v["type"], "status");
        assert_eq!(v["status"], "starting_agent");

        let v = serde_json::to_value(SessionEvent::ExecutionSessionEnded {
            id: 4,
            status: ExecutionSessionStatus::Interrupted,
        })
        .unwrap();
        assert_eq!(v["type"], "execution_session_ended");
        assert_eq!(v["status"], "interrupted");
    }
}
