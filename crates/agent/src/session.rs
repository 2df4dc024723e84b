//! AgentSession — lifecycle and streaming for one CLI subprocess.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use ms_domain::config::AgentConfig;
use ms_domain::event::SessionEvent;
use ms_domain::paths;
use ms_domain::{Error, Result};

use crate::wire::{self, CliMessage};

/// Wall-clock budget for the CLI to report its first status.
pub const START_TIMEOUT_SECS: u64 = 30;

/// Current state of an [`AgentSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Streaming,
    Thinking,
    ToolUse,
    Interrupted,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Thinking => "thinking",
            SessionStatus::ToolUse => "tool_use",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Disconnected => "disconnected",
        }
    }

    fn from_wire(s: &str) -> Self {
        match s {
            "connecting" => SessionStatus::Connecting,
            "streaming" => SessionStatus::Streaming,
            "thinking" => SessionStatus::Thinking,
            "tool_use" => SessionStatus::ToolUse,
            "interrupted" => SessionStatus::Interrupted,
            "disconnected" => SessionStatus::Disconnected,
            _ => SessionStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum StartState {
    Pending,
    Ready,
    Failed(String),
}

struct Inner {
    local_id: String,
    config: AgentConfig,
    resume_id: Option<String>,
    status: Mutex<SessionStatus>,
    backend_id: Mutex<Option<String>>,
    cost: Mutex<f64>,
    turns: Mutex<u32>,
    stdin_tx: Mutex<Option<mpsc::Sender<String>>>,
    /// Event sink of the in-flight turn, if any.
    current_turn: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    start_state: watch::Sender<StartState>,
}

/// One coding-agent CLI conversation.
///
/// ```no_run
/// # async fn demo() -> ms_domain::Result<()> {
/// use ms_agent::AgentSession;
/// use ms_domain::config::AgentConfig;
///
/// let session = AgentSession::new(AgentConfig::default(), None, None, false);
/// session.start().await?;
/// let mut events = session.send("Hello!").await?;
/// while let Some(event) = events.recv().await {
///     // stream typed events
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AgentSession {
    inner: Arc<Inner>,
}

impl AgentSession {
    pub fn new(
        config: AgentConfig,
        local_id: Option<String>,
        resume_id: Option<String>,
        fork: bool,
    ) -> Self {
        let local_id = local_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (start_state, _) = watch::channel(StartState::Pending);
        // A resumed session keeps the prior backend id; forks get a fresh
        // one from the CLI on the first turn.
        let backend_id = if fork { None } else { resume_id.clone() };
        Self {
            inner: Arc::new(Inner {
                local_id,
                config,
                resume_id,
                status: Mutex::new(SessionStatus::Disconnected),
                backend_id: Mutex::new(backend_id),
                cost: Mutex::new(0.0),
                turns: Mutex::new(0),
                stdin_tx: Mutex::new(None),
                current_turn: Mutex::new(None),
                start_state,
            }),
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn backend_id(&self) -> Option<String> {
        self.inner.backend_id.lock().clone()
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.lock()
    }

    pub fn cost(&self) -> f64 {
        *self.inner.cost.lock()
    }

    pub fn turns(&self) -> u32 {
        *self.inner.turns.lock()
    }

    pub fn is_healthy(&self) -> bool {
        self.status() != SessionStatus::Disconnected
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Spawn the CLI subprocess and wait for it to report ready.
    ///
    /// Returns the stable local id. Fails with `start_failed` when the
    /// spawn or handshake errors, `start_timeout` after 30 s of silence.
    pub async fn start(&self) -> Result<String> {
        let inner = &self.inner;
        *inner.status.lock() = SessionStatus::Connecting;

        let argv = &inner.config.cli_command;
        let Some((program, base_args)) = argv.split_first() else {
            return Err(Error::StartFailed("empty cli_command".into()));
        };

        let mut cmd = Command::new(program);
        cmd.args(base_args);
        if let Some(model) = &inner.config.model {
            cmd.args(["--model", model]);
        }
        cmd.args(["--permission-mode", &inner.config.permission_mode]);
        if let Some(n) = inner.config.max_turns {
            cmd.args(["--max-turns", &n.to_string()]);
        }
        if let Some(resume) = &inner.resume_id {
            cmd.args(["--resume", resume]);
            if inner.backend_id.lock().is_none() {
                cmd.arg("--fork");
            }
        }
        cmd.current_dir(&inner.config.project_dir)
            .env("CLAUDE_CONFIG_DIR", paths::cli_config_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            *inner.status.lock() = SessionStatus::Disconnected;
            Error::StartFailed(format!("failed to spawn {program}: {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::StartFailed("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::StartFailed("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        // Writer task: owns stdin; the pipe closes when every sender to
        // this channel is dropped, which is what makes the CLI exit.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });
        *inner.stdin_tx.lock() = Some(stdin_tx);

        // Stderr task: surface CLI diagnostics in our logs.
        if let Some(stderr) = stderr {
            let local_id = inner.local_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session_id = %local_id, "cli stderr: {line}");
                }
            });
        }

        // Reaper task: owns the child so the OS process is collected.
        let local_id = inner.local_id.clone();
        tokio::spawn(async move {
            let mut child = child;
            match child.wait().await {
                Ok(status) => {
                    tracing::debug!(session_id = %local_id, %status, "cli subprocess exited")
                }
                Err(e) => tracing::warn!(session_id = %local_id, error = %e, "cli wait failed"),
            }
        });

        // Reader task: translate stdout lines into events.
        let reader_inner = inner.clone();
        tokio::spawn(async move {
            read_loop(reader_inner, stdout).await;
        });

        // Wait for the first status line.
        let mut rx = inner.start_state.subscribe();
        let wait = async {
            loop {
                let state = rx.borrow().clone();
                match state {
                    StartState::Ready => return Ok(()),
                    StartState::Failed(msg) => return Err(Error::StartFailed(msg)),
                    StartState::Pending => {
                        if rx.changed().await.is_err() {
                            return Err(Error::StartFailed("session dropped".into()));
                        }
                    }
                }
            }
        };
        match tokio::time::timeout(Duration::from_secs(START_TIMEOUT_SECS), wait).await {
            Ok(Ok(())) => {
                tracing::info!(
                    session_id = %inner.local_id,
                    resume = inner.resume_id.is_some(),
                    "agent session started"
                );
                Ok(inner.local_id.clone())
            }
            Ok(Err(e)) => {
                *inner.status.lock() = SessionStatus::Disconnected;
                Err(e)
            }
            Err(_) => {
                *inner.status.lock() = SessionStatus::Disconnected;
                Err(Error::StartTimeout(START_TIMEOUT_SECS))
            }
        }
    }

    /// Send a user prompt; events stream on the returned receiver until a
    /// `turn_complete` or `error` event.
    pub async fn send(&self, text: &str) -> Result<mpsc::Receiver<SessionEvent>> {
        self.dispatch(wire::encode_user(text)).await
    }

    /// Send a slash command (e.g. `/compact`); same event stream as `send`.
    pub async fn command(&self, text: &str) -> Result<mpsc::Receiver<SessionEvent>> {
        self.dispatch(wire::encode_command(text)).await
    }

    /// Interrupt the current response. Safe to call at any time; a no-op
    /// when nothing is streaming.
    pub async fn interrupt(&self) {
        let in_flight = self.inner.current_turn.lock().is_some();
        if !in_flight {
            return;
        }
        let tx = self.inner.stdin_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(wire::encode_interrupt()).await;
            *self.inner.status.lock() = SessionStatus::Interrupted;
        }
    }

    /// Release the subprocess handle: the CLI exits once its stdin closes.
    ///
    /// Only the graceful process-exit path calls this; `pool.close`
    /// merely drops its `Arc` so the same thing happens implicitly.
    pub fn stop(&self) {
        self.inner.stdin_tx.lock().take();
        *self.inner.status.lock() = SessionStatus::Disconnected;
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn dispatch(&self, frame: String) -> Result<mpsc::Receiver<SessionEvent>> {
        let tx = self
            .inner
            .stdin_tx
            .lock()
            .clone()
            .ok_or(Error::NotStarted)?;

        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(256);
        // Replace any stale sink: if a previous turn never terminated
        // (e.g. interrupt the CLI ignored), its stream simply ends here.
        *self.inner.current_turn.lock() = Some(event_tx);
        *self.inner.status.lock() = SessionStatus::Streaming;

        if tx.send(frame).await.is_err() {
            self.inner.current_turn.lock().take();
            *self.inner.status.lock() = SessionStatus::Disconnected;
            return Err(Error::Other("agent subprocess is gone".into()));
        }
        Ok(event_rx)
    }
}

/// Translate CLI stdout into session events and bookkeeping.
async fn read_loop(inner: Arc<Inner>, stdout: tokio::process::ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(session_id = %inner.local_id, error = %e, "cli stdout read failed");
                break;
            }
        };

        let Some(msg) = wire::parse_line(&line) else {
            continue;
        };

        match msg {
            CliMessage::Status(status) => {
                *inner.status.lock() = SessionStatus::from_wire(&status);
                inner.start_state.send_replace(StartState::Ready);
            }
            CliMessage::Event(event) => {
                match &event {
                    SessionEvent::TextDelta { .. } => {
                        *inner.status.lock() = SessionStatus::Streaming;
                    }
                    SessionEvent::ThinkingDelta { .. } => {
                        *inner.status.lock() = SessionStatus::Thinking;
                    }
                    SessionEvent::ToolUse { .. } => {
                        *inner.status.lock() = SessionStatus::ToolUse;
                    }
                    SessionEvent::TurnComplete {
                        cost,
                        num_turns,
                        backend_id,
                        ..
                    } => {
                        if let Some(c) = cost {
                            *inner.cost.lock() += c;
                        }
                        *inner.turns.lock() += num_turns;
                        // First turn of a fresh session: record the id the
                        // CLI chose for its own log. Never re-key later.
                        if let Some(bid) = backend_id {
                            let mut stored = inner.backend_id.lock();
                            if stored.is_none() {
                                *stored = Some(bid.clone());
                            }
                        }
                        *inner.status.lock() = SessionStatus::Idle;
                    }
                    _ => {}
                }

                let terminal = event.is_terminal();
                let tx = inner.current_turn.lock().clone();
                if let Some(tx) = tx {
                    if tx.send(event).await.is_err() {
                        inner.current_turn.lock().take();
                    } else if terminal {
                        inner.current_turn.lock().take();
                    }
                }
            }
        }
    }

    // Subprocess went away.
    *inner.status.lock() = SessionStatus::Disconnected;
    inner.stdin_tx.lock().take();
    let failed = StartState::Failed("agent subprocess exited".into());
    inner.start_state.send_if_modified(|s| {
        if *s == StartState::Pending {
            *s = failed;
            true
        } else {
            false
        }
    });
    let tx = inner.current_turn.lock().take();
    if let Some(tx) = tx {
        let _ = tx
            .send(SessionEvent::error(
                "send_failed",
                "agent subprocess exited mid-turn",
            ))
            .await;
    }
    tracing::info!(session_id = %inner.local_id, "agent session disconnected");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
