//! End-to-end session flow against a fake in-process sprite.
//!
//! The fake serves the sprite HTTP API (create + blocking exec) and the
//! streaming exec WebSocket. Its scripted "agent" answers every user
//! turn with one assistant message (text + a Bash tool use), the
//! matching tool result, and a message_stop — deliberately split across
//! WebSocket frames mid-JSON to exercise reassembly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures_util::StreamExt;
use tokio::sync::broadcast;

use sd_domain::config::Config;
use sd_domain::model::{ExecutionSessionStatus, TaskStatus};
use sd_gateway::runtime::allocator::{self, AllocatorDeps};
use sd_gateway::runtime::events::{SessionEvent, SessionStatus};
use sd_gateway::runtime::registry::SupervisorRegistry;
use sd_gateway::runtime::supervisor::{self, SupervisorDeps, SupervisorHandle};
use sd_gateway::runtime::token::TokenManager;
use sd_sprites::SpriteClient;
use sd_store::Database;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fake sprite
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frame-encode one stdout chunk.
fn stdout_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = vec![1u8];
    frame.extend_from_slice(data);
    frame
}

async fn fake_exec() -> impl IntoResponse {
    // Good enough for the credential probe (configured) and pkill.
    let mut body = stdout_frame(b"store\n");
    body.extend_from_slice(&[3, 0]);
    body
}

async fn fake_create() -> impl IntoResponse {
    axum::Json(serde_json::json!({"name": "box"}))
}

async fn fake_stream(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(scripted_agent)
}

/// The scripted inner agent.
async fn scripted_agent(mut socket: WebSocket) {
    let init = stdout_frame(b"{\"type\":\"system\",\"subtype\":\"init\"}\n");
    if socket.send(WsMessage::Binary(init)).await.is_err() {
        return;
    }

    while let Some(Ok(msg)) = socket.next().await {
        let data = match msg {
            WsMessage::Binary(data) => data,
            WsMessage::Close(_) => return,
            _ => continue,
        };
        if data == [0x03] {
            continue; // interrupt: nothing in flight to stop
        }

        // A user turn arrived. Reply with a turn, split mid-JSON across
        // two frames (the second without a tag byte: a continuation).
        let assistant = br#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello."},{"type":"tool_use","id":"u1","name":"Bash","input":{"command":"ls"}}]}}"#;
        let (head, tail) = assistant.split_at(40);
        let _ = socket.send(WsMessage::Binary(stdout_frame(head))).await;
        let mut rest = tail.to_vec();
        rest.push(b'\n');
        let _ = socket.send(WsMessage::Binary(rest)).await;

        let result_then_stop = concat!(
            r#"{"type":"user","tool_use_result":{"stdout":"a\nb\n","isError":false},"#,
            r#""message":{"content":[{"type":"tool_result","tool_use_id":"u1"}]}}"#,
            "\n",
            r#"{"type":"message_stop"}"#,
            "\n",
        );
        let _ = socket
            .send(WsMessage::Binary(stdout_frame(result_then_stop.as_bytes())))
            .await;
    }
}

async fn start_fake_sprite() -> SocketAddr {
    let app = Router::new()
        .route("/v1/sprites", post(fake_create))
        .route("/v1/sprites/:name/exec", post(fake_exec).get(fake_stream));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// A fake sprite whose streaming endpoint is gone (404 on upgrade).
async fn start_fake_sprite_without_stream() -> SocketAddr {
    let app = Router::new()
        .route("/v1/sprites", post(fake_create))
        .route("/v1/sprites/:name/exec", post(fake_exec));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    store: Arc<Database>,
    registry: Arc<SupervisorRegistry>,
    deps: SupervisorDeps,
}

fn harness(addr: SocketAddr, idle_timeout_secs: u64) -> Harness {
    let base = format!("http://{addr}");
    let mut config = Config::default();
    config.sprites.base_url = base.clone();
    config.sprites.default_sprite = "box".into();
    config.sessions.idle_timeout_secs = idle_timeout_secs;
    let config = Arc::new(config);

    let store = Arc::new(Database::open_in_memory().unwrap());
    let sprites = Arc::new(SpriteClient::new(&base, "sprite-token").unwrap());
    let tokens = Arc::new(
        TokenManager::new(store.clone(), &config.oauth, Some("agent-token".into())).unwrap(),
    );
    let registry = Arc::new(SupervisorRegistry::new());

    let allocator = allocator::spawn(AllocatorDeps {
        store: store.clone(),
        sprites: sprites.clone(),
        tokens: tokens.clone(),
        config: config.clone(),
        github_token: None,
    });

    let deps = SupervisorDeps {
        store: store.clone(),
        sprites,
        tokens,
        allocator,
        registry: registry.clone(),
        config,
        github_token: None,
    };

    Harness {
        store,
        registry,
        deps,
    }
}

fn start_session(h: &Harness) -> (SupervisorHandle, broadcast::Receiver<SessionEvent>, i64) {
    let task = h.store.create_task(Some("demo"), None).unwrap();
    let task_id = task.id;
    let handle = supervisor::start(task, None, h.deps.clone());
    let events = handle.subscribe();
    (handle, events, task_id)
}

async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event stream closed")
}

async fn expect_status(rx: &mut broadcast::Receiver<SessionEvent>, want: SessionStatus) {
    match next_event(rx).await {
        SessionEvent::Status { status } if status == want => {}
        other => panic!("expected status {want:?}, got {other:?}"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_turn_with_tool_back_patch() {
    let addr = start_fake_sprite().await;
    let h = harness(addr, 300);
    let (handle, mut events, task_id) = start_session(&h);

    assert!(handle.send_message("hi".into()).await);

    expect_status(&mut events, SessionStatus::Connecting).await;
    expect_status(&mut events, SessionStatus::StartingAgent).await;

    let session_id = match next_event(&mut events).await {
        SessionEvent::ExecutionSessionStarted { id } => id,
        other => panic!("expected session start, got {other:?}"),
    };
    expect_status(&mut events, SessionStatus::Ready).await;
    expect_status(&mut events, SessionStatus::Processing).await;

    match next_event(&mut events).await {
        SessionEvent::AgentText { text } => assert_eq!(text, "Hello."),
        other => panic!("expected agent text, got {other:?}"),
    }
    match next_event(&mut events).await {
        SessionEvent::ToolUse {
            tool_use_id, name, ..
        } => {
            assert_eq!(tool_use_id, "u1");
            assert_eq!(name, "Bash");
        }
        other => panic!("expected tool use, got {other:?}"),
    }
    match next_event(&mut events).await {
        SessionEvent::ToolResult {
            tool_use_id,
            output,
            is_error,
        } => {
            assert_eq!(tool_use_id, "u1");
            assert_eq!(output, "a\nb\n");
            assert!(!is_error);
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, SessionEvent::AgentDone));
    expect_status(&mut events, SessionStatus::Ready).await;

    // Persisted state: task awaits input, session row is running, the
    // tool call carries its back-patched output.
    let task = h.store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingInput);

    let session = h.store.get_execution_session(session_id).unwrap().unwrap();
    assert_eq!(session.status, ExecutionSessionStatus::Started);

    let call = h.store.find_tool_message(task_id, "u1").unwrap().unwrap();
    let data = call.tool_data.unwrap();
    assert_eq!(data["output"], "a\nb\n");
    assert_eq!(data["is_error"], false);
    assert_eq!(data["name"], "Bash");
}

#[tokio::test]
async fn queued_turn_is_delivered_after_message_stop() {
    let addr = start_fake_sprite().await;
    let h = harness(addr, 300);
    let (handle, mut events, _task_id) = start_session(&h);

    // Two turns up front: the second must wait for the first to finish.
    assert!(handle.send_message("one".into()).await);
    assert!(handle.send_message("two".into()).await);

    let mut agent_done = 0;
    let mut processing = 0;
    while agent_done < 2 {
        match next_event(&mut events).await {
            SessionEvent::AgentDone => agent_done += 1,
            SessionEvent::Status {
                status: SessionStatus::Processing,
            } => processing += 1,
            _ => {}
        }
    }
    // Each turn got its own processing transition, in order.
    assert_eq!(processing, 2);
}

#[tokio::test]
async fn idle_timeout_hibernates_then_user_turn_wakes() {
    let addr = start_fake_sprite().await;
    let h = harness(addr, 1);
    let (handle, mut events, task_id) = start_session(&h);

    assert!(handle.send_message("hi".into()).await);

    // Run through the first turn.
    loop {
        if matches!(next_event(&mut events).await, SessionEvent::AgentDone) {
            break;
        }
    }

    // After the 1 s quiet period the session goes idle and the channel
    // is torn down so the sprite can hibernate.
    let mut saw_idle = false;
    for _ in 0..10 {
        match next_event(&mut events).await {
            SessionEvent::Status {
                status: SessionStatus::Idle,
            } => {
                saw_idle = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_idle, "session never went idle");
    let task = h.store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Idle);
    // The idle teardown closed the execution session.
    assert!(h.store.started_execution_session(task_id).unwrap().is_none());

    // A new turn wakes the channel and is delivered exactly once.
    assert!(handle.send_message("ping".into()).await);
    expect_status(&mut events, SessionStatus::StartingAgent).await;

    let mut saw_done = false;
    for _ in 0..20 {
        match next_event(&mut events).await {
            SessionEvent::AgentDone => {
                saw_done = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_done, "wake turn never completed");

    // A fresh execution session was opened for the wake.
    assert_eq!(h.store.list_execution_sessions(task_id).unwrap().len(), 2);
}

#[tokio::test]
async fn missing_stream_endpoint_stops_the_supervisor() {
    let addr = start_fake_sprite_without_stream().await;
    let h = harness(addr, 300);
    let (_handle, mut events, task_id) = start_session(&h);

    let mut saw_stopped = false;
    for _ in 0..20 {
        match next_event(&mut events).await {
            SessionEvent::Status {
                status: SessionStatus::Stopped,
            } => {
                saw_stopped = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_stopped, "supervisor never stopped after 404");

    // The registry entry is gone; a reopened session would start fresh.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.registry.get(task_id).is_none());
}
