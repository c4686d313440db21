//! The session supervisor — one live instance per active task.
//!
//! Owns the task's sprite allocation and agent channel, routes user
//! turns (strict FIFO), persists the derived conversation, relays agent
//! events to subscribers, and enforces the idle timeout that lets the
//! sprite hibernate.
//!
//! Lifecycle: `initializing → connecting → starting_agent → ready ⇄
//! processing`, with `idle` after the quiet period, `disconnected` after
//! exhausted reconnects, `error` for allocation failures, and `stopped`
//! as the terminal state. A user turn arriving while the channel is down
//! (idle, disconnected, or after agent exit) is queued and wakes the
//! channel; it is never silently discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use sd_domain::config::Config;
use sd_domain::error::{Error, Result};
use sd_domain::model::{ExecutionSessionStatus, MessageKind, Repo, Task, TaskStatus};
use sd_protocol::AgentEvent;
use sd_sprites::SpriteClient;
use sd_store::{CreateMessage, Database};

use crate::state::AppState;

use super::allocator::AllocatorHandle;
use super::channel::{self, ChannelEvent, ChannelHandle, ChannelParams};
use super::events::{SessionEvent, SessionStatus};
use super::registry::SupervisorRegistry;
use super::token::TokenManager;

/// Commands a client can issue against a live session.
pub enum SessionCommand {
    SendMessage(String),
    Interrupt,
    Terminate,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct SupervisorHandle {
    pub task_id: i64,
    tx: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SupervisorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Queue a user turn. Returns false when the supervisor is gone.
    pub async fn send_message(&self, text: String) -> bool {
        self.tx
            .send(SessionCommand::SendMessage(text))
            .await
            .is_ok()
    }

    pub async fn interrupt(&self) {
        let _ = self.tx.send(SessionCommand::Interrupt).await;
    }

    pub async fn terminate(&self) {
        let _ = self.tx.send(SessionCommand::Terminate).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything a supervisor needs from the application.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub store: Arc<Database>,
    pub sprites: Arc<SpriteClient>,
    pub tokens: Arc<TokenManager>,
    pub allocator: AllocatorHandle,
    pub registry: Arc<SupervisorRegistry>,
    pub config: Arc<Config>,
    pub github_token: Option<String>,
}

/// Attach to the live supervisor for a task, or start one.
pub fn ensure_supervisor(state: &AppState, task: Task) -> Result<SupervisorHandle> {
    if let Some(handle) = state.registry.get(task.id) {
        return Ok(handle);
    }
    let repo = match task.repo_id {
        Some(repo_id) => state.store.get_repo(repo_id)?,
        None => None,
    };
    let deps = SupervisorDeps {
        store: state.store.clone(),
        sprites: state.sprites.clone(),
        tokens: state.tokens.clone(),
        allocator: state.allocator.clone(),
        registry: state.registry.clone(),
        config: state.config.clone(),
        github_token: state.github_token.clone(),
    };
    Ok(start(task, repo, deps))
}

/// Register and spawn a supervisor for a task.
pub fn start(task: Task, repo: Option<Repo>, deps: SupervisorDeps) -> SupervisorHandle {
    let (tx, cmd_rx) = mpsc::channel(64);
    let (events, _) = broadcast::channel(256);
    let handle = SupervisorHandle {
        task_id: task.id,
        tx,
        events: events.clone(),
    };
    deps.registry.insert(task.id, handle.clone());

    let supervisor = Supervisor {
        task,
        repo,
        deps,
        events,
        cmd_rx,
        status: SessionStatus::Connecting,
        channel: None,
        chan_rx: None,
        channel_alive: false,
        sprite_name: None,
        working_dir: None,
        exec_session_id: None,
        queue: VecDeque::new(),
        idle_deadline: None,
    };
    tokio::spawn(supervisor.run());
    handle
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Supervisor {
    task: Task,
    repo: Option<Repo>,
    deps: SupervisorDeps,
    events: broadcast::Sender<SessionEvent>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    status: SessionStatus,
    channel: Option<ChannelHandle>,
    chan_rx: Option<mpsc::Receiver<ChannelEvent>>,
    /// False once the channel task ended (agent exit, disconnect, idle
    /// teardown). A Ready/Idle/Disconnected status with a dead channel
    /// means the next user turn restarts it.
    channel_alive: bool,
    sprite_name: Option<String>,
    working_dir: Option<String>,
    exec_session_id: Option<i64>,
    /// Pending user turns, strict FIFO.
    queue: VecDeque<String>,
    idle_deadline: Option<Instant>,
}

async fn next_channel_event(rx: &mut Option<mpsc::Receiver<ChannelEvent>>) -> Option<ChannelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// One loop wakeup, resolved to an owned value.
enum Wake {
    Command(Option<SessionCommand>),
    Channel(Option<ChannelEvent>),
    IdleTimeout,
}

impl Supervisor {
    async fn run(mut self) {
        tracing::info!(task_id = self.task.id, "session supervisor starting");
        self.initialize().await;

        loop {
            // Resolve the wakeup into an owned value before dispatching,
            // so handlers are free to mutate all of self.
            let deadline = self.idle_deadline;
            let wake = tokio::select! {
                cmd = self.cmd_rx.recv() => Wake::Command(cmd),
                ev = next_channel_event(&mut self.chan_rx) => Wake::Channel(ev),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => Wake::IdleTimeout,
            };

            match wake {
                Wake::Command(Some(SessionCommand::SendMessage(text))) => {
                    self.on_send_message(text).await;
                }
                Wake::Command(Some(SessionCommand::Interrupt)) => {
                    if let Some(ch) = &self.channel {
                        ch.interrupt().await;
                    }
                }
                Wake::Command(Some(SessionCommand::Terminate)) | Wake::Command(None) => break,
                Wake::Channel(Some(ev)) => {
                    if self.on_channel_event(ev).await {
                        break;
                    }
                }
                Wake::Channel(None) => {
                    self.chan_rx = None;
                    self.channel_alive = false;
                }
                Wake::IdleTimeout => self.on_idle_timeout().await,
            }
        }

        self.cleanup().await;
    }

    // ── init ─────────────────────────────────────────────────────────

    async fn initialize(&mut self) {
        self.publish(SessionEvent::Status {
            status: SessionStatus::Connecting,
        });

        let timeout = Duration::from_secs(self.deps.config.sessions.allocate_timeout_secs);
        match tokio::time::timeout(timeout, self.deps.allocator.allocate(self.task.id)).await {
            Err(_) => {
                // The lock must not survive an abandoned allocation.
                self.deps.allocator.release(self.task.id).await;
                self.fail("sprite allocation timed out");
            }
            Ok(Err(Error::RepoLocked { holder, repo_id })) => {
                tracing::warn!(
                    task_id = self.task.id,
                    repo_id,
                    holder,
                    "allocation refused: repo locked"
                );
                self.fail("Repository in use by another task");
            }
            Ok(Err(e)) => {
                tracing::error!(task_id = self.task.id, error = %e, "allocation failed");
                self.fail("could not prepare a sandbox for this task");
            }
            Ok(Ok(setup)) => {
                self.set_task_status(TaskStatus::Active);
                self.sprite_name = Some(setup.sprite_name);
                self.working_dir = Some(setup.working_dir);
                self.start_channel().await;
            }
        }
    }

    async fn start_channel(&mut self) {
        let (sprite_name, working_dir) = match (&self.sprite_name, &self.working_dir) {
            (Some(sprite), Some(wd)) => (sprite.clone(), wd.clone()),
            _ => {
                self.fail("no sprite allocated");
                return;
            }
        };

        let oauth_token = match self.deps.tokens.get_access_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(task_id = self.task.id, error = %e, "no agent credential");
                self.fail("agent credentials unavailable; seed an OAuth token");
                return;
            }
        };

        let params = ChannelParams {
            sprite_name,
            working_dir,
            repo_display_name: self.repo.as_ref().map(|r| r.display_name.clone()),
            agent_binary: self.deps.config.agent.binary.clone(),
            oauth_token,
            github_token: self.deps.github_token.clone(),
        };

        let (tx, rx) = mpsc::channel(256);
        self.channel = Some(channel::spawn(self.deps.sprites.clone(), params, tx));
        self.chan_rx = Some(rx);
        self.channel_alive = true;
        self.status = SessionStatus::StartingAgent;
        self.publish(SessionEvent::Status {
            status: SessionStatus::StartingAgent,
        });
    }

    // ── user turns ───────────────────────────────────────────────────

    async fn on_send_message(&mut self, text: String) {
        self.idle_deadline = None;

        if let Err(e) = self.deps.store.create_message(CreateMessage {
            task_id: self.task.id,
            execution_session_id: self.exec_session_id,
            kind: MessageKind::User,
            content: Some(text.clone()),
            tool_data: None,
        }) {
            tracing::warn!(task_id = self.task.id, error = %e, "failed to persist user turn");
        }

        self.queue.push_back(text);

        if self.status == SessionStatus::Processing {
            // FIFO: delivered after the current turn's message_stop.
            return;
        }
        if self.status == SessionStatus::Ready && self.channel_alive {
            self.drain_one().await;
            return;
        }
        // Idle, disconnected, or exited (ready with a dead channel):
        // the queued turn wakes the channel; error states just queue.
        if matches!(
            self.status,
            SessionStatus::Ready | SessionStatus::Idle | SessionStatus::Disconnected
        ) {
            self.start_channel().await;
        }
    }

    /// Deliver the next queued turn if the agent is ready for one.
    async fn drain_one(&mut self) {
        if self.status != SessionStatus::Ready || !self.channel_alive {
            return;
        }
        let Some(text) = self.queue.pop_front() else {
            return;
        };
        let Some(channel) = &self.channel else {
            self.queue.push_front(text);
            return;
        };
        if channel.send_user_turn(text.clone()).await {
            self.idle_deadline = None;
            self.set_task_status(TaskStatus::Active);
            self.status = SessionStatus::Processing;
            self.publish(SessionEvent::Status {
                status: SessionStatus::Processing,
            });
        } else {
            // The channel died under us; keep the turn for the restart.
            self.queue.push_front(text);
            self.channel_alive = false;
        }
    }

    // ── channel events ───────────────────────────────────────────────

    /// Returns true when the supervisor must stop.
    async fn on_channel_event(&mut self, ev: ChannelEvent) -> bool {
        match ev {
            ChannelEvent::Ready => {
                self.on_channel_ready().await;
                false
            }
            ChannelEvent::Event(event) => {
                self.on_agent_event(event).await;
                false
            }
            ChannelEvent::Raw(text) => {
                self.publish(SessionEvent::Raw { text });
                false
            }
            ChannelEvent::Stderr(text) => {
                tracing::debug!(task_id = self.task.id, stderr = %text, "agent stderr");
                false
            }
            ChannelEvent::Exit(code) => {
                let status = if code == 0 {
                    ExecutionSessionStatus::Completed
                } else {
                    ExecutionSessionStatus::Failed
                };
                tracing::info!(task_id = self.task.id, code, "agent exited");
                self.close_execution_session(status);
                self.channel = None;
                self.channel_alive = false;
                self.set_task_status(TaskStatus::AwaitingInput);
                self.set_ready();
                false
            }
            ChannelEvent::Disconnected => {
                tracing::warn!(task_id = self.task.id, "agent channel disconnected");
                self.channel = None;
                self.channel_alive = false;
                self.status = SessionStatus::Disconnected;
                self.publish(SessionEvent::Status {
                    status: SessionStatus::Disconnected,
                });
                false
            }
            ChannelEvent::DisconnectedFatal => {
                tracing::warn!(task_id = self.task.id, "sprite gone; stopping supervisor");
                self.close_execution_session(ExecutionSessionStatus::Interrupted);
                true
            }
            ChannelEvent::Terminated { reason } => {
                tracing::debug!(task_id = self.task.id, reason = %reason, "channel terminated");
                self.channel_alive = false;
                false
            }
        }
    }

    async fn on_channel_ready(&mut self) {
        let sprite = self.sprite_name.clone().unwrap_or_default();
        // A reconnect within a running session keeps the session row.
        if self.exec_session_id.is_none() {
            match self
                .deps
                .store
                .start_execution_session(self.task.id, &sprite, "agent")
            {
                Ok(session) => {
                    self.exec_session_id = Some(session.id);
                    if let Err(e) = self.deps.store.create_message(CreateMessage {
                        task_id: self.task.id,
                        execution_session_id: Some(session.id),
                        kind: MessageKind::SessionStart,
                        content: None,
                        tool_data: None,
                    }) {
                        tracing::warn!(error = %e, "failed to persist session_start marker");
                    }
                    self.publish(SessionEvent::ExecutionSessionStarted { id: session.id });
                }
                Err(e) => {
                    tracing::error!(task_id = self.task.id, error = %e, "could not open execution session");
                }
            }
        }
        self.set_ready();
        self.drain_one().await;
    }

    async fn on_agent_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::AssistantMessage { text, tool_uses } => {
                if !text.is_empty() {
                    if let Err(e) = self.deps.store.create_message(CreateMessage {
                        task_id: self.task.id,
                        execution_session_id: self.exec_session_id,
                        kind: MessageKind::Assistant,
                        content: Some(text.clone()),
                        tool_data: None,
                    }) {
                        tracing::warn!(error = %e, "failed to persist assistant message");
                    }
                    self.publish(SessionEvent::AgentText { text });
                }
                for tool_use in tool_uses {
                    if let Err(e) = self.deps.store.create_message(CreateMessage {
                        task_id: self.task.id,
                        execution_session_id: self.exec_session_id,
                        kind: MessageKind::ToolCall,
                        content: None,
                        tool_data: Some(serde_json::json!({
                            "tool_use_id": tool_use.id,
                            "name": tool_use.name,
                            "input": tool_use.input,
                        })),
                    }) {
                        tracing::warn!(error = %e, "failed to persist tool call");
                    }
                    self.publish(SessionEvent::ToolUse {
                        tool_use_id: tool_use.id,
                        name: tool_use.name,
                        input: tool_use.input,
                    });
                }
            }
            AgentEvent::ToolResult {
                tool_use_id,
                stdout,
                stderr,
                is_error,
            } => {
                let output = if stderr.is_empty() {
                    stdout
                } else if stdout.is_empty() {
                    stderr
                } else {
                    format!("{stdout}\n{stderr}")
                };
                match self.deps.store.find_tool_message(self.task.id, &tool_use_id) {
                    Ok(Some(msg)) => {
                        if let Err(e) = self.deps.store.update_tool_result(msg.id, &output, is_error)
                        {
                            tracing::warn!(error = %e, tool_use_id = %tool_use_id, "tool result back-patch failed");
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(tool_use_id = %tool_use_id, "tool result without a matching call");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "tool message lookup failed");
                    }
                }
                self.publish(SessionEvent::ToolResult {
                    tool_use_id,
                    output,
                    is_error,
                });
            }
            AgentEvent::MessageStop => {
                self.publish(SessionEvent::AgentDone);
                self.set_ready();
                self.set_task_status(TaskStatus::AwaitingInput);
                self.idle_deadline = Some(
                    Instant::now()
                        + Duration::from_secs(self.deps.config.sessions.idle_timeout_secs),
                );
                self.drain_one().await;
            }
            AgentEvent::SystemInit { .. } => {
                tracing::debug!(task_id = self.task.id, "agent initialized");
            }
            AgentEvent::Other { kind, .. } => {
                tracing::debug!(task_id = self.task.id, kind = %kind, "unmodeled agent event");
            }
            AgentEvent::Raw { text } => {
                self.publish(SessionEvent::Raw { text });
            }
        }
    }

    // ── idle / teardown ──────────────────────────────────────────────

    async fn on_idle_timeout(&mut self) {
        tracing::info!(task_id = self.task.id, "idle timeout; letting the sprite hibernate");
        self.idle_deadline = None;
        self.close_execution_session(ExecutionSessionStatus::Completed);
        if let Some(channel) = self.channel.take() {
            channel.shutdown().await;
        }
        self.channel_alive = false;
        self.set_task_status(TaskStatus::Idle);
        self.status = SessionStatus::Idle;
        self.publish(SessionEvent::Status {
            status: SessionStatus::Idle,
        });
    }

    async fn cleanup(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.shutdown().await;
        }
        self.close_execution_session(ExecutionSessionStatus::Interrupted);
        self.deps.allocator.release(self.task.id).await;
        self.set_task_status(TaskStatus::Idle);
        self.publish(SessionEvent::Status {
            status: SessionStatus::Stopped,
        });
        self.deps.registry.remove(self.task.id);
        tracing::info!(task_id = self.task.id, "session supervisor stopped");
    }

    fn close_execution_session(&mut self, status: ExecutionSessionStatus) {
        let Some(id) = self.exec_session_id.take() else {
            return;
        };
        if let Err(e) = self.deps.store.complete_execution_session(id, status) {
            tracing::warn!(error = %e, session = id, "failed to close execution session");
        }
        if let Err(e) = self.deps.store.create_message(CreateMessage {
            task_id: self.task.id,
            execution_session_id: Some(id),
            kind: MessageKind::SessionEnd,
            content: None,
            tool_data: None,
        }) {
            tracing::warn!(error = %e, "failed to persist session_end marker");
        }
        self.publish(SessionEvent::ExecutionSessionEnded { id, status });
    }

    // ── small helpers ────────────────────────────────────────────────

    fn set_ready(&mut self) {
        self.status = SessionStatus::Ready;
        self.publish(SessionEvent::Status {
            status: SessionStatus::Ready,
        });
    }

    fn set_task_status(&self, status: TaskStatus) {
        if let Err(e) = self.deps.store.set_task_status(self.task.id, status) {
            tracing::warn!(task_id = self.task.id, error = %e, "task status update failed");
        }
    }

    fn fail(&mut self, user_message: &str) {
        self.publish(SessionEvent::AgentError {
            text: user_message.to_owned(),
        });
        self.status = SessionStatus::Error;
        self.publish(SessionEvent::Status {
            status: SessionStatus::Error,
        });
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine; events are also persisted.
        let _ = self.events.send(event);
    }
}
