//! The sprite API client.

use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use sd_domain::error::{Error, Result};
use sd_protocol::{Frame, FrameDecoder};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A sprite record as returned by the remote API. Fields beyond the name
/// are provider-side details we pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sprite {
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Command for an exec call.
#[derive(Debug, Clone)]
pub enum Cmd {
    /// Explicit argv; each element becomes one `cmd` query parameter.
    Argv(Vec<String>),
    /// A shell string, wrapped as `/bin/sh -c <string>`.
    Shell(String),
}

impl Cmd {
    fn into_argv(self) -> Vec<String> {
        match self {
            Cmd::Argv(argv) => argv,
            Cmd::Shell(script) => vec!["/bin/sh".into(), "-c".into(), script],
        }
    }
}

/// Options for a blocking exec.
#[derive(Debug, Clone)]
pub struct ExecOpts {
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            env: Vec::new(),
        }
    }
}

/// Decoded result of a blocking exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr concatenated, for error reporting.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Options for streaming exec URL construction.
#[derive(Debug, Clone)]
pub struct StreamOpts {
    pub tty: bool,
    pub stdin: bool,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl Default for StreamOpts {
    fn default() -> Self {
        Self {
            tty: false,
            stdin: true,
            cols: None,
            rows: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stateless facade over the remote sprite API. Created once; the
/// underlying `reqwest::Client` pools connections.
#[derive(Debug, Clone)]
pub struct SpriteClient {
    http: Client,
    base_url: String,
    token: String,
}

impl SpriteClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
        })
    }

    /// Bearer token for the WebSocket upgrade request (the agent channel
    /// builds that request itself).
    pub fn bearer_token(&self) -> &str {
        &self.token
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Create a sprite, or return the existing one on a 409 conflict.
    pub async fn create(&self, name: &str, public: bool) -> Result<Sprite> {
        let auth = if public { "public" } else { "sprite" };
        let resp = self
            .http
            .post(self.url("/v1/sprites"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "name": name,
                "url_settings": {"auth": auth},
            }))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                resp.json().await.map_err(|e| Error::Http(e.to_string()))
            }
            StatusCode::CONFLICT => {
                tracing::debug!(sprite = name, "sprite exists, reusing");
                self.get(name).await
            }
            status => Err(api_error(status, resp).await),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Sprite> {
        let resp = self
            .http
            .get(self.url(&format!("/v1/sprites/{}", encode(name))))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(api_error(resp.status(), resp).await);
        }
        resp.json().await.map_err(|e| Error::Http(e.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Sprite>> {
        let resp = self
            .http
            .get(self.url("/v1/sprites"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(api_error(resp.status(), resp).await);
        }
        resp.json().await.map_err(|e| Error::Http(e.to_string()))
    }

    pub async fn suspend(&self, name: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/v1/sprites/{}/suspend", encode(name))))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(api_error(resp.status(), resp).await);
        }
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/v1/sprites/{}", encode(name))))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(api_error(resp.status(), resp).await);
        }
        Ok(())
    }

    /// Blocking exec: run a command to completion and decode the framed
    /// response body into stdout/stderr/exit_code.
    pub async fn exec(&self, name: &str, cmd: Cmd, opts: ExecOpts) -> Result<ExecOutput> {
        let query = exec_query(&cmd.into_argv(), &opts.env, None);
        let url = format!(
            "{}?{}",
            self.url(&format!("/v1/sprites/{}/exec", encode(name))),
            query
        );

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .timeout(opts.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("exec on sprite {name}"))
                } else {
                    Error::Http(e.to_string())
                }
            })?;
        if !resp.status().is_success() {
            return Err(api_error(resp.status(), resp).await);
        }

        let body = resp.bytes().await.map_err(|e| Error::Http(e.to_string()))?;
        let mut decoder = FrameDecoder::new();
        let mut out = ExecOutput::default();
        for frame in decoder.push(&body) {
            match frame {
                Frame::Stdout(data) => out.stdout.push_str(&String::from_utf8_lossy(&data)),
                Frame::Stderr(data) => out.stderr.push_str(&String::from_utf8_lossy(&data)),
                Frame::Exit(code) => out.exit_code = code as i32,
            }
        }
        Ok(out)
    }

    /// Build the WebSocket URL for a streaming exec. No side effects;
    /// authentication rides on the upgrade request headers.
    pub fn stream_url(&self, name: &str, argv: &[String], opts: &StreamOpts) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };

        let mut extra = vec![
            ("tty", opts.tty.to_string()),
            ("stdin", opts.stdin.to_string()),
        ];
        if let Some(cols) = opts.cols {
            extra.push(("cols", cols.to_string()));
        }
        if let Some(rows) = opts.rows {
            extra.push(("rows", rows.to_string()));
        }

        let query = exec_query(argv, &[], Some(&extra));
        format!("{ws_base}/v1/sprites/{}/exec?{query}", encode(name))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Percent-encode a query value or path segment. Everything outside
/// `[A-Za-z0-9]` is escaped, reserved characters like `@` and `'`
/// included.
fn encode(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

/// Build the exec query string: repeated `cmd` params, `env=KEY=VALUE`
/// params, plus any extra pairs.
fn exec_query(argv: &[String], env: &[(String, String)], extra: Option<&[(&str, String)]>) -> String {
    let mut pairs: Vec<String> = argv
        .iter()
        .map(|arg| format!("cmd={}", encode(arg)))
        .collect();
    for (key, value) in env {
        pairs.push(format!("env={}", encode(&format!("{key}={value}"))));
    }
    if let Some(extra) = extra {
        for (key, value) in extra {
            pairs.push(format!("{key}={}", encode(value)));
        }
    }
    pairs.join("&")
}

async fn api_error(status: StatusCode, resp: reqwest::Response) -> Error {
    let message = resp.text().await.unwrap_or_default();
    let message = if message.chars().count() > 300 {
        let truncated: String = message.chars().take(300).collect();
        format!("{truncated}…")
    } else {
        message
    };
    Error::SpriteApi {
        status: status.as_u16(),
        message,
    }
}
