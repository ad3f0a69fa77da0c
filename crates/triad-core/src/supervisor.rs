//! Process supervision for a single agent.
//!
//! Runs one external command inside its workspace, streams stdout/stderr
//! line by line, enforces the wall-clock budget, and classifies
//! termination. Classification priority when causes race:
//! cancelled, then timeout, then failed, then succeeded.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::AgentKey;
use crate::{Result, TriadError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Configuration for supervising one agent process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub job_id: Uuid,
    pub agent_key: AgentKey,
    /// Wall-clock budget for the whole process.
    pub timeout: Duration,
    /// Grace interval between the polite termination signal and the kill.
    pub grace: Duration,
    /// Lines longer than this are truncated before forwarding.
    pub max_line_bytes: usize,
}

/// A command ready to be executed by the supervisor.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// Optional payload written to the child's stdin, which is then closed.
    pub stdin_payload: Option<String>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd,
            stdin_payload: None,
        }
    }

    /// Build from an explicit argv, as supplied by a command override.
    pub fn from_argv(argv: &[String], cwd: PathBuf) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TriadError::Process("command override is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: Vec::new(),
            cwd,
            stdin_payload: None,
        })
    }
}

/// Lifecycle events emitted by the supervisor, in production order.
/// `Started` is always first; exactly one terminal event is last.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Started {
        pid: u32,
        at: DateTime<Utc>,
    },
    Stdout {
        line: String,
    },
    Stderr {
        line: String,
    },
    /// The line that follows was cut down to the configured maximum.
    LineTruncated {
        original_len: usize,
    },
    Exited {
        code: i32,
        at: DateTime<Utc>,
    },
    Failed {
        error: String,
        at: DateTime<Utc>,
    },
    TimedOut {
        at: DateTime<Utc>,
    },
    Cancelled {
        at: DateTime<Utc>,
    },
}

impl SupervisorEvent {
    /// Terminal classification carried by this event, if it is terminal.
    pub fn terminal_state(&self) -> Option<TerminalState> {
        match self {
            SupervisorEvent::Exited { code, .. } => Some(if *code == 0 {
                TerminalState::Succeeded
            } else {
                TerminalState::Failed
            }),
            SupervisorEvent::Failed { .. } => Some(TerminalState::Failed),
            SupervisorEvent::TimedOut { .. } => Some(TerminalState::Timeout),
            SupervisorEvent::Cancelled { .. } => Some(TerminalState::Cancelled),
            _ => None,
        }
    }
}

/// Terminal state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Succeeded,
    Failed,
    Timeout,
    Cancelled,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::Succeeded => "succeeded",
            TerminalState::Failed => "failed",
            TerminalState::Timeout => "timeout",
            TerminalState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collected result of running one agent to completion.
#[derive(Debug)]
pub struct SupervisorResult {
    pub state: TerminalState,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

/// The process supervisor manages a single agent process.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
}

// ---------------------------------------------------------------------------
// Implementation
// ---------------------------------------------------------------------------

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Spawn the agent process and supervise it.
    ///
    /// Returns the event receiver; the stream ends right after the terminal
    /// event. Cancelling `cancel` is idempotent and a no-op once the agent
    /// is terminal.
    pub async fn spawn(
        &self,
        command: AgentCommand,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<SupervisorEvent>> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let config = self.config.clone();

        let stdin_cfg = if command.stdin_payload.is_some() {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&command.cwd)
            .stdin(stdin_cfg)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TriadError::launch)?;

        let pid = child
            .id()
            .ok_or_else(|| TriadError::Process("process exited before pid was read".into()))?;

        let _ = event_tx
            .send(SupervisorEvent::Started {
                pid,
                at: Utc::now(),
            })
            .await;

        if let Some(payload) = command.stdin_payload {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                TriadError::Process("child stdin unavailable for payload".into())
            })?;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!(error = %e, "failed to deliver stdin payload");
                }
                // Dropping stdin closes the pipe so the child sees EOF.
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            TriadError::Process("child stdout unavailable".into())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TriadError::Process("child stderr unavailable".into())
        })?;

        tokio::spawn(async move {
            supervise_loop(config, child, stdout, stderr, event_tx, cancel).await;
        });

        Ok(event_rx)
    }

    /// Run the agent to completion, collecting all output.
    pub async fn run_to_completion(
        &self,
        command: AgentCommand,
        cancel: CancellationToken,
    ) -> Result<SupervisorResult> {
        let mut rx = self.spawn(command, cancel).await?;

        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let mut exit_code = None;
        let mut state = TerminalState::Failed;
        let mut started_at = Utc::now();
        let mut finished_at = started_at;

        while let Some(event) = rx.recv().await {
            match event {
                SupervisorEvent::Started { at, .. } => started_at = at,
                SupervisorEvent::Stdout { line } => stdout_lines.push(line),
                SupervisorEvent::Stderr { line } => stderr_lines.push(line),
                SupervisorEvent::LineTruncated { .. } => {}
                SupervisorEvent::Exited { code, at } => {
                    exit_code = Some(code);
                    finished_at = at;
                    state = if code == 0 {
                        TerminalState::Succeeded
                    } else {
                        TerminalState::Failed
                    };
                }
                SupervisorEvent::Failed { at, .. } => {
                    finished_at = at;
                    state = TerminalState::Failed;
                }
                SupervisorEvent::TimedOut { at } => {
                    finished_at = at;
                    state = TerminalState::Timeout;
                }
                SupervisorEvent::Cancelled { at } => {
                    finished_at = at;
                    state = TerminalState::Cancelled;
                }
            }
        }

        Ok(SupervisorResult {
            state,
            exit_code,
            started_at,
            finished_at,
            stdout_lines,
            stderr_lines,
        })
    }
}

// ---------------------------------------------------------------------------
// Core supervision loop
// ---------------------------------------------------------------------------

/// A line read from the child, tagged with its stream and original length
/// when it was truncated.
struct ReadLine {
    stderr: bool,
    text: String,
    truncated_from: Option<usize>,
}

async fn supervise_loop(
    config: SupervisorConfig,
    mut child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    event_tx: mpsc::Sender<SupervisorEvent>,
    cancel: CancellationToken,
) {
    let job_id = config.job_id;
    let agent_key = config.agent_key;

    // Merge stdout and stderr into a single stream via a local channel.
    let (line_tx, mut line_rx) = mpsc::channel::<ReadLine>(256);
    let stdout_task = tokio::spawn(read_lines(
        stdout,
        false,
        config.max_line_bytes,
        line_tx.clone(),
    ));
    let stderr_task = tokio::spawn(read_lines(stderr, true, config.max_line_bytes, line_tx));

    let deadline = tokio::time::Instant::now() + config.timeout;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(%job_id, %agent_key, "cancel signal received");
                terminate_child(&mut child, config.grace).await;
                let _ = event_tx.send(SupervisorEvent::Cancelled { at: Utc::now() }).await;
                break;
            }

            _ = tokio::time::sleep_until(deadline) => {
                warn!(%job_id, %agent_key, timeout_secs = config.timeout.as_secs(), "wall-clock budget exceeded");
                terminate_child(&mut child, config.grace).await;
                let _ = event_tx.send(SupervisorEvent::TimedOut { at: Utc::now() }).await;
                break;
            }

            line = line_rx.recv() => {
                match line {
                    Some(line) => {
                        if let Some(original_len) = line.truncated_from {
                            let _ = event_tx
                                .send(SupervisorEvent::LineTruncated { original_len })
                                .await;
                        }
                        let event = if line.stderr {
                            SupervisorEvent::Stderr { line: line.text }
                        } else {
                            SupervisorEvent::Stdout { line: line.text }
                        };
                        let _ = event_tx.send(event).await;
                    }
                    None => {
                        // Both output streams closed; wait for process exit.
                        match child.wait().await {
                            Ok(status) => {
                                let code = exit_code_of(&status);
                                debug!(%job_id, %agent_key, code, "process exited");
                                let _ = event_tx
                                    .send(SupervisorEvent::Exited { code, at: Utc::now() })
                                    .await;
                            }
                            Err(e) => {
                                let _ = event_tx
                                    .send(SupervisorEvent::Failed {
                                        error: e.to_string(),
                                        at: Utc::now(),
                                    })
                                    .await;
                            }
                        }
                        break;
                    }
                }
            }
        }
    }

    stdout_task.abort();
    stderr_task.abort();
}

/// Forward each completed line, truncating oversized ones at a char
/// boundary so the payload stays valid UTF-8.
async fn read_lines<R>(reader: R, stderr: bool, max_bytes: usize, tx: mpsc::Sender<ReadLine>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let msg = if line.len() > max_bytes {
            let mut end = max_bytes;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            ReadLine {
                stderr,
                truncated_from: Some(line.len()),
                text: line[..end].to_string(),
            }
        } else {
            ReadLine {
                stderr,
                text: line,
                truncated_from: None,
            }
        };
        if tx.send(msg).await.is_err() {
            break;
        }
    }
}

/// Map an exit status to a code, folding signal deaths to -1.
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

// ---------------------------------------------------------------------------
// Platform-specific process termination
// ---------------------------------------------------------------------------

#[cfg(unix)]
async fn terminate_child(child: &mut tokio::process::Child, grace: Duration) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        let _ = signal::kill(pid, Signal::SIGTERM);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => (),
            Err(_) => {
                warn!(?pid, "process did not exit after SIGTERM; sending SIGKILL");
                let _ = signal::kill(pid, Signal::SIGKILL);
                let _ = child.wait().await;
            }
        }
    } else {
        // Process already exited.
        let _ = child.wait().await;
    }
}

#[cfg(windows)]
async fn terminate_child(child: &mut tokio::process::Child, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
