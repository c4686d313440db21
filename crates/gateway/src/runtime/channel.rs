//! The agent channel — one streaming exec connection per live agent.
//!
//! Spawned by a session supervisor, which it notifies over an mpsc of
//! [`ChannelEvent`]s. The channel owns the WebSocket, runs the frame
//! decoder + line assembler + event parser over inbound binary frames,
//! and writes user turns / the interrupt byte back.
//!
//! Disconnect policy: a 404 on the upgrade means the sprite is gone —
//! fatal, no reconnection. Any other abnormal closure retries with
//! bounded exponential backoff and jitter before giving up.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;

use sd_protocol::{events, parse_line, AgentEvent, Frame, FrameDecoder, LineAssembler, INTERRUPT_BYTE};
use sd_sprites::{Cmd as SpriteCmd, ExecOpts, SpriteClient, StreamOpts};

use super::sh_quote;

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events and commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Notifications from the channel to its owning supervisor.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The stream is connected and the agent process is launching.
    Ready,
    /// A parsed structured event from the agent's stdout.
    Event(AgentEvent),
    /// stdout bytes that were not a structured event line.
    Raw(String),
    /// A chunk from the agent's stderr.
    Stderr(String),
    /// The agent process exited with this code.
    Exit(i32),
    /// Abnormal disconnect; reconnection attempts are exhausted.
    Disconnected,
    /// The sprite is gone (404 on upgrade); do not restart this channel.
    DisconnectedFatal,
    /// Graceful shutdown completed.
    Terminated { reason: String },
}

enum ChannelCmd {
    SendUserTurn(String),
    Interrupt,
    Shutdown,
}

/// Everything needed to build the launch command.
#[derive(Debug, Clone)]
pub struct ChannelParams {
    pub sprite_name: String,
    pub working_dir: String,
    pub repo_display_name: Option<String>,
    pub agent_binary: String,
    pub oauth_token: String,
    pub github_token: Option<String>,
}

/// Handle held by the supervisor.
#[derive(Clone)]
pub struct ChannelHandle {
    tx: mpsc::Sender<ChannelCmd>,
}

impl ChannelHandle {
    /// Queue one user turn for delivery as a single binary frame.
    pub async fn send_user_turn(&self, text: String) -> bool {
        self.tx.send(ChannelCmd::SendUserTurn(text)).await.is_ok()
    }

    pub async fn interrupt(&self) {
        let _ = self.tx.send(ChannelCmd::Interrupt).await;
    }

    /// Graceful teardown: pkill the agent so the sprite can hibernate.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ChannelCmd::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawn + run loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn spawn(
    client: Arc<SpriteClient>,
    params: ChannelParams,
    owner: mpsc::Sender<ChannelEvent>,
) -> ChannelHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    tokio::spawn(run(client, params, owner, cmd_rx));
    ChannelHandle { tx: cmd_tx }
}

enum ConnectFailure {
    /// 404 on the upgrade: the sprite no longer exists.
    Fatal,
    Retryable(String),
}

async fn connect(
    client: &SpriteClient,
    url: &str,
) -> std::result::Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    ConnectFailure,
> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectFailure::Retryable(e.to_string()))?;
    let bearer = format!("Bearer {}", client.bearer_token());
    request.headers_mut().insert(
        "Authorization",
        bearer
            .parse()
            .map_err(|_| ConnectFailure::Retryable("bad bearer header".into()))?,
    );

    match connect_async(request).await {
        Ok((ws, _resp)) => Ok(ws),
        Err(tungstenite::Error::Http(resp)) if resp.status().as_u16() == 404 => {
            Err(ConnectFailure::Fatal)
        }
        Err(e) => Err(ConnectFailure::Retryable(e.to_string())),
    }
}

async fn run(
    client: Arc<SpriteClient>,
    params: ChannelParams,
    owner: mpsc::Sender<ChannelEvent>,
    mut cmd_rx: mpsc::Receiver<ChannelCmd>,
) {
    let argv = vec![
        "/bin/sh".to_owned(),
        "-c".to_owned(),
        launch_command(&params),
    ];
    let url = client.stream_url(&params.sprite_name, &argv, &StreamOpts::default());

    let mut attempt: u32 = 0;
    loop {
        let ws = match connect(&client, &url).await {
            Ok(ws) => ws,
            Err(ConnectFailure::Fatal) => {
                tracing::warn!(sprite = %params.sprite_name, "sprite gone (404 on upgrade)");
                let _ = owner.send(ChannelEvent::DisconnectedFatal).await;
                return;
            }
            Err(ConnectFailure::Retryable(e)) => {
                attempt += 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    tracing::warn!(sprite = %params.sprite_name, error = %e, "giving up on reconnect");
                    let _ = owner.send(ChannelEvent::Disconnected).await;
                    return;
                }
                let delay = backoff_delay(attempt);
                tracing::debug!(
                    sprite = %params.sprite_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "stream connect failed, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        attempt = 0;
        tracing::info!(sprite = %params.sprite_name, "agent stream connected");
        if owner.send(ChannelEvent::Ready).await.is_err() {
            return;
        }

        let (mut sink, mut stream) = ws.split();
        let mut decoder = FrameDecoder::new();
        let mut lines = LineAssembler::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ChannelCmd::SendUserTurn(text)) => {
                        let frame = events::user_turn_line(&text).into_bytes();
                        if sink.send(Message::Binary(frame)).await.is_err() {
                            break; // reconnect
                        }
                    }
                    Some(ChannelCmd::Interrupt) => {
                        let _ = sink.send(Message::Binary(vec![INTERRUPT_BYTE])).await;
                    }
                    Some(ChannelCmd::Shutdown) | None => {
                        pkill_agent(&client, &params);
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = owner
                            .send(ChannelEvent::Terminated {
                                reason: "shutdown".into(),
                            })
                            .await;
                        return;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        for frame in decoder.push(&data) {
                            match frame {
                                Frame::Stdout(bytes) => {
                                    for line in lines.push(&bytes) {
                                        let event = match parse_line(&line) {
                                            AgentEvent::Raw { text } => ChannelEvent::Raw(text),
                                            parsed => ChannelEvent::Event(parsed),
                                        };
                                        if owner.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Frame::Stderr(bytes) => {
                                    let text = String::from_utf8_lossy(&bytes).into_owned();
                                    if owner.send(ChannelEvent::Stderr(text)).await.is_err() {
                                        return;
                                    }
                                }
                                Frame::Exit(code) => {
                                    // Trailing partial output surfaces unparsed.
                                    if let Some(rest) = lines.flush() {
                                        let _ = owner.send(ChannelEvent::Raw(rest)).await;
                                    }
                                    let _ = owner.send(ChannelEvent::Exit(code as i32)).await;
                                    return;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break, // reconnect
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "stream read error");
                        break; // reconnect
                    }
                },
            }
        }

        // Abnormal closure: retry the connection.
        attempt += 1;
        if attempt > MAX_RECONNECT_ATTEMPTS {
            let _ = owner.send(ChannelEvent::Disconnected).await;
            return;
        }
        tokio::time::sleep(backoff_delay(attempt)).await;
    }
}

/// Fire-and-forget pkill of the agent process so the sprite can
/// hibernate. Failure only costs prompt hibernation.
fn pkill_agent(client: &Arc<SpriteClient>, params: &ChannelParams) {
    let client = client.clone();
    let sprite = params.sprite_name.clone();
    let binary = params.agent_binary.clone();
    tokio::spawn(async move {
        let result = client
            .exec(
                &sprite,
                SpriteCmd::Shell(format!("pkill -f {}", sh_quote(&binary))),
                ExecOpts {
                    timeout: Duration::from_secs(10),
                    env: Vec::new(),
                },
            )
            .await;
        if let Err(e) = result {
            tracing::debug!(sprite = %sprite, error = %e, "pkill after shutdown failed");
        }
    });
}

/// The shell command the streaming exec runs: cd into the working
/// directory, export credentials, launch the agent in stream-JSON mode.
fn launch_command(params: &ChannelParams) -> String {
    let mut cmd = format!("cd {} && ", sh_quote(&params.working_dir));
    cmd.push_str(&format!(
        "AGENT_OAUTH_TOKEN={} ",
        sh_quote(&params.oauth_token)
    ));
    if let Some(gh) = &params.github_token {
        cmd.push_str(&format!("GH_TOKEN={} ", sh_quote(gh)));
    }
    cmd.push_str(&params.agent_binary);
    cmd.push_str(" --print --input-format stream-json --output-format stream-json --verbose");
    if let Some(repo) = &params.repo_display_name {
        let prompt = format!("You are working in the {repo} repository.");
        cmd.push_str(&format!(" --append-system-prompt {}", sh_quote(&prompt)));
    }
    cmd
}

/// Bounded exponential backoff with ±50% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(10));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jittered = rand::thread_rng().gen_range((capped / 2)..=(capped * 3 / 2));
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ChannelParams {
        ChannelParams {
            sprite_name: "box".into(),
            working_dir: "/home/sprite/repos/acme/widget".into(),
            repo_display_name: Some("acme/widget".into()),
            agent_binary: "agent".into(),
            oauth_token: "tok-123".into(),
            github_token: None,
        }
    }

    #[test]
    fn launch_command_shape() {
        let cmd = launch_command(&params());
        assert!(cmd.starts_with("cd '/home/sprite/repos/acme/widget' && "));
        assert!(cmd.contains("AGENT_OAUTH_TOKEN='tok-123' "));
        assert!(cmd.contains(
            "agent --print --input-format stream-json --output-format stream-json --verbose"
        ));
        assert!(cmd.ends_with("--append-system-prompt 'You are working in the acme/widget repository.'"));
        assert!(!cmd.contains("GH_TOKEN"));
    }

    #[test]
    fn launch_command_with_github_token() {
        let mut p = params();
        p.github_token = Some("gh-456".into());
        let cmd = launch_command(&p);
        assert!(cmd.contains("GH_TOKEN='gh-456' "));
    }

    #[test]
    fn launch_command_without_repo_has_no_system_prompt() {
        let mut p = params();
        p.repo_display_name = None;
        p.working_dir = "/home/sprite".into();
        let cmd = launch_command(&p);
        assert!(!cmd.contains("--append-system-prompt"));
        assert!(cmd.starts_with("cd '/home/sprite' && "));
    }

    #[test]
    fn launch_command_escapes_quotes_in_repo_name() {
        let mut p = params();
        p.repo_display_name = Some("o'brien/repo".into());
        let cmd = launch_command(&p);
        assert!(cmd.contains(r"o'\''brien/repo"));
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        for attempt in 1..=10 {
            let d = backoff_delay(attempt);
            // Jitter is ±50% around the capped exponential.
            assert!(d >= Duration::from_millis(BACKOFF_BASE_MS / 2));
            assert!(d <= Duration::from_millis(BACKOFF_CAP_MS * 3 / 2));
        }
        // Early attempts stay well under the cap.
        let d = backoff_delay(1);
        assert!(d <= Duration::from_millis(BACKOFF_BASE_MS * 3 / 2));
    }
}
