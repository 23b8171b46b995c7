//! Rate limits over the Codex app-server protocol.
//!
//! `codex app-server` speaks newline-delimited JSON on stdin/stdout. We only
//! need three messages:
//!
//! 1. `initialize` (id 0) with our client info
//! 2. once id 0 answers: the `initialized` notification, then
//!    `account/rateLimits/read` (id 1)
//! 3. once id 1 answers: done, kill the server
//!
//! The whole exchange shares one deadline. Whatever happens, the child is
//! killed and reaped before returning.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tracing::{debug, trace};

use super::limits::RateLimitSnapshot;
use crate::core::context::CodexEnv;
use crate::core::error::QuotaError;

const INITIALIZE_ID: i64 = 0;
const RATE_LIMITS_ID: i64 = 1;
const CLIENT_NAME: &str = "qbar";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitInit,
    AwaitRateLimits,
    Done,
    Failed,
}

/// What the driver should do after a line from the server.
#[derive(Debug)]
pub enum Step {
    Send(Vec<Value>),
    Wait,
    Done(RateLimitSnapshot),
    Failed(QuotaError),
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    id: Option<Value>,
    result: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RateLimitsResult {
    #[serde(alias = "rate_limits", rename = "rateLimits")]
    rate_limits: Option<RateLimitSnapshot>,
}

/// The client side of the handshake, independent of any process.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
}

impl Handshake {
    /// A fresh handshake plus the opening `initialize` request.
    pub fn start() -> (Self, Vec<Value>) {
        let initialize = json!({
            "method": "initialize",
            "id": INITIALIZE_ID,
            "params": {
                "clientInfo": {
                    "name": CLIENT_NAME,
                    "title": CLIENT_NAME,
                    "version": CLIENT_VERSION,
                }
            }
        });
        (
            Self {
                state: HandshakeState::AwaitInit,
            },
            vec![initialize],
        )
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn on_line(&mut self, line: &str) -> Step {
        let line = line.trim();
        if line.is_empty() {
            return Step::Wait;
        }
        let msg: IncomingMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                trace!(error = %e, "Ignoring non-JSON line from app-server");
                return Step::Wait;
            }
        };
        let id = msg.id.as_ref().and_then(Value::as_i64);

        match (self.state, id) {
            (HandshakeState::AwaitInit, Some(INITIALIZE_ID)) => {
                if let Some(err) = msg.error {
                    return self.fail(format!("initialize rejected: {}", err));
                }
                self.state = HandshakeState::AwaitRateLimits;
                Step::Send(vec![
                    json!({ "method": "initialized" }),
                    json!({
                        "method": "account/rateLimits/read",
                        "id": RATE_LIMITS_ID,
                        "params": {},
                    }),
                ])
            }
            (HandshakeState::AwaitRateLimits, Some(RATE_LIMITS_ID)) => {
                if let Some(err) = msg.error {
                    return self.fail(format!("rateLimits/read rejected: {}", err));
                }
                let parsed = msg
                    .result
                    .map(serde_json::from_value::<RateLimitsResult>)
                    .transpose();
                match parsed {
                    Ok(Some(RateLimitsResult {
                        rate_limits: Some(snapshot),
                    })) if snapshot.has_windows() => {
                        self.state = HandshakeState::Done;
                        Step::Done(snapshot)
                    }
                    Ok(_) => {
                        self.state = HandshakeState::Failed;
                        Step::Failed(QuotaError::NoData(
                            "No rate limit data from app-server".to_string(),
                        ))
                    }
                    Err(e) => self.fail(format!("unreadable rate limits: {}", e)),
                }
            }
            // Notifications and stray responses
            _ => Step::Wait,
        }
    }

    fn fail(&mut self, message: String) -> Step {
        self.state = HandshakeState::Failed;
        Step::Failed(QuotaError::Upstream(message))
    }
}

/// Spawn the app-server, run the handshake under `timeout`, kill it.
pub async fn read_rate_limits(env: &CodexEnv, timeout: Duration) -> Result<RateLimitSnapshot, QuotaError> {
    let mut child = Command::new(&env.binary)
        .args(&env.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| QuotaError::Unknown(format!("Failed to spawn {}: {}", env.binary, e)))?;
    debug!(binary = %env.binary, pid = ?child.id(), "Spawned Codex app-server");

    let result = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => {
            match tokio::time::timeout(timeout, drive(stdin, stdout)).await {
                Ok(r) => r,
                Err(_) => Err(QuotaError::Timeout(format!(
                    "app-server did not answer within {}ms",
                    timeout.as_millis()
                ))),
            }
        }
        _ => Err(QuotaError::Unknown("app-server stdio unavailable".to_string())),
    };

    if let Err(e) = child.kill().await {
        debug!(error = %e, "Failed to kill Codex app-server");
    }
    result
}

async fn drive(mut stdin: ChildStdin, stdout: ChildStdout) -> Result<RateLimitSnapshot, QuotaError> {
    let mut lines = BufReader::new(stdout).lines();
    let (mut handshake, opening) = Handshake::start();
    send(&mut stdin, &opening).await?;

    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| QuotaError::Unknown(format!("app-server read failed: {}", e)))?
            .ok_or_else(|| QuotaError::Unknown("app-server exited early".to_string()))?;
        trace!(state = ?handshake.state(), line = %line, "app-server");

        match handshake.on_line(&line) {
            Step::Send(messages) => send(&mut stdin, &messages).await?,
            Step::Wait => {}
            Step::Done(snapshot) => return Ok(snapshot),
            Step::Failed(err) => return Err(err),
        }
    }
}

async fn send(stdin: &mut ChildStdin, messages: &[Value]) -> Result<(), QuotaError> {
    for message in messages {
        let mut line = message.to_string();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| QuotaError::Unknown(format!("app-server write failed: {}", e)))?;
    }
    stdin
        .flush()
        .await
        .map_err(|e| QuotaError::Unknown(format!("app-server write failed: {}", e)))
}
