//! Core data model records shared between the store and the runtime.
//!
//! Status enums round-trip through their `as_str`/`parse` forms because
//! the store persists them as TEXT columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A user conversation, optionally bound to a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: Option<String>,
    pub status: TaskStatus,
    pub repo_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    AwaitingInput,
    Idle,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingInput => "awaiting_input",
            Self::Idle => "idle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "awaiting_input" => Some(Self::AwaitingInput),
            "idle" => Some(Self::Idle),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A registered source repository. `locked_by_task_id` is the DB-enforced
/// exclusive reservation — non-null iff exactly one task holds the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub remote_url: String,
    pub display_name: String,
    pub default_branch: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub locked_by_task_id: Option<i64>,
    pub locked_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One contiguous span of agent context. While `status` is `Started`,
/// `ended_at` is null and no sibling `Started` row exists for the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSession {
    pub id: i64,
    pub task_id: i64,
    pub sprite_name: String,
    pub kind: String,
    pub status: ExecutionSessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSessionStatus {
    Started,
    Completed,
    Failed,
    Interrupted,
}

impl ExecutionSessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Started)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A persisted conversation entry. Append-only in kind/session membership;
/// assistant content streams in and tool output is back-patched while the
/// owning execution session is still running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub task_id: i64,
    pub execution_session_id: Option<i64>,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub tool_data: Option<serde_json::Value>,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    System,
    ToolCall,
    Error,
    SessionStart,
    SessionEnd,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::ToolCall => "tool_call",
            Self::Error => "error",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "tool_call" => Some(Self::ToolCall),
            "error" => Some(Self::Error),
            "session_start" => Some(Self::SessionStart),
            "session_end" => Some(Self::SessionEnd),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OAuth token
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The singleton OAuth credential row (`user_id` is NULL for the global
/// token; the column is uniquely indexed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthToken {
    pub id: i64,
    pub user_id: Option<i64>,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Option<String>,
    pub subscription_tier: Option<String>,
}

impl OauthToken {
    /// True when the access token is expired or expires within `buffer`.
    pub fn needs_refresh(&self, buffer: chrono::Duration) -> bool {
        Utc::now() + buffer >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for s in [TaskStatus::Active, TaskStatus::AwaitingInput, TaskStatus::Idle] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            ExecutionSessionStatus::Started,
            ExecutionSessionStatus::Completed,
            ExecutionSessionStatus::Failed,
            ExecutionSessionStatus::Interrupted,
        ] {
            assert_eq!(ExecutionSessionStatus::parse(s.as_str()), Some(s));
        }
        for k in [
            MessageKind::User,
            MessageKind::Assistant,
            MessageKind::System,
            MessageKind::ToolCall,
            MessageKind::Error,
            MessageKind::SessionStart,
            MessageKind::SessionEnd,
        ] {
            assert_eq!(MessageKind::parse(k.as_str()), Some(k));
        }
    }

    #[test]
    fn only_started_is_non_terminal() {
        assert!(!ExecutionSessionStatus::Started.is_terminal());
        assert!(ExecutionSessionStatus::Completed.is_terminal());
        assert!(ExecutionSessionStatus::Failed.is_terminal());
        assert!(ExecutionSessionStatus::Interrupted.is_terminal());
    }

    #[test]
    fn needs_refresh_respects_buffer() {
        let mut tok = OauthToken {
            id: 1,
            user_id: None,
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            scopes: None,
            subscription_tier: None,
        };
        // 60s left, 5 min buffer → refresh.
        assert!(tok.needs_refresh(chrono::Duration::seconds(300)));
        tok.expires_at = Utc::now() + chrono::Duration::seconds(3600);
        assert!(!tok.needs_refresh(chrono::Duration::seconds(300)));
    }
}
