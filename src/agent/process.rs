//! Agent process spawning and stdio plumbing.
//!
//! Each spawned process gets:
//! - `kill_on_drop(true)` so a dropped supervisor never leaks a child.
//! - A supervisor task that forwards stdout/stderr lines, waits for exit,
//!   and reports [`ProcessSignal::Exited`] only after the output readers have
//!   drained, so every line is observed before the exit.
//! - An optional stdin writer task fed through an mpsc channel; dropping the
//!   sender closes the child's stdin.
//!
//! Every message is tagged with the process `generation` so the runner can
//! ignore stragglers from a process it has already finished with.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::codec::AgentCodec;
use crate::{AppError, Result};

/// How long the supervisor waits for stdout/stderr to reach EOF after the
/// child exits. Grandchildren that inherited the pipes can hold them open.
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Capacity of the stdin message channel.
const INPUT_CHANNEL_CAPACITY: usize = 16;

/// Environment variable carrying the runner's session id into the agent.
pub const SESSION_ID_ENV: &str = "AGENT_RUNNER_SESSION_ID";

/// Fully resolved command line for one agent process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Binary to execute.
    pub binary: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Working directory; inherits the server's when `None`.
    pub working_dir: Option<PathBuf>,
    /// Whether stdin is piped (streaming) or null (one-shot).
    pub pipe_stdin: bool,
}

/// Output or lifecycle signal from a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessSignal {
    /// One stdout line.
    Stdout(String),
    /// One stderr line.
    Stderr(String),
    /// The process exited and its output has been drained.
    Exited(ProcessExit),
}

/// A [`ProcessSignal`] tagged with the process generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMessage {
    /// Generation assigned at spawn time.
    pub generation: u64,
    /// The signal.
    pub signal: ProcessSignal,
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number (unix), when killed by a signal.
    pub signal: Option<i32>,
    /// Error raised while waiting on the child.
    pub wait_error: Option<String>,
}

impl ProcessExit {
    /// Whether the process exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable description for logs and metadata.
    #[must_use]
    pub fn describe(&self) -> String {
        match (self.code, self.signal, &self.wait_error) {
            (Some(code), _, _) => format!("exited with code {code}"),
            (None, Some(9), _) => "killed by SIGKILL (signal 9)".to_owned(),
            (None, Some(15), _) => "killed by SIGTERM (signal 15)".to_owned(),
            (None, Some(sig), _) => format!("killed by signal {sig}"),
            (None, None, Some(err)) => format!("wait error: {err}"),
            (None, None, None) => "exited (unknown status)".to_owned(),
        }
    }

    fn from_status(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: exit_signal(status),
                wait_error: None,
            },
            Err(err) => Self {
                wait_error: Some(err.to_string()),
                ..Self::default()
            },
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// Handle to a live agent process owned by a runner.
#[derive(Debug)]
pub struct AttachedProcess {
    generation: u64,
    pid: Option<u32>,
    input: Option<mpsc::Sender<Value>>,
    kill: CancellationToken,
}

impl AttachedProcess {
    /// Generation tag used on this process's messages.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// OS process id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue one JSON message for the child's stdin.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if stdin is not piped, already closed, or
    /// the writer is backed up.
    pub fn send_input(&self, message: Value) -> Result<()> {
        let Some(input) = &self.input else {
            return Err(AppError::Protocol("agent stdin is closed".into()));
        };
        input
            .try_send(message)
            .map_err(|err| AppError::Protocol(format!("failed to queue agent input: {err}")))
    }

    /// Close stdin and send SIGTERM (unix). Safe to call repeatedly.
    pub fn request_shutdown(&mut self) {
        self.input = None;
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            send_sigterm(pid);
        }
    }

    /// Force-kill the child; its exit is still reported through the channel.
    pub fn force_kill(&self) {
        self.kill.cancel();
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => debug!(pid, "sent SIGTERM to agent process"),
        Err(nix::errno::Errno::ESRCH) => debug!(pid, "agent process already gone"),
        Err(err) => warn!(pid, %err, "failed to send SIGTERM to agent process"),
    }
}

/// Spawn an agent process and start its supervisor.
///
/// # Errors
///
/// Returns `AppError::Spawn` if the OS refuses to launch the binary or its
/// stdio cannot be captured.
pub fn spawn_process(
    spec: &ProcessSpec,
    session_id: &str,
    generation: u64,
    events: mpsc::UnboundedSender<ProcessMessage>,
) -> Result<AttachedProcess> {
    let mut cmd = Command::new(&spec.binary);
    cmd.args(&spec.args)
        .env(SESSION_ID_ENV, session_id)
        .stdin(if spec.pipe_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn {}: {err}", spec.binary)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;
    let stdin = child.stdin.take();
    let pid = child.id();

    info!(session_id, pid, generation, binary = %spec.binary, "agent process spawned");

    let kill = CancellationToken::new();
    let input = stdin.map(|stdin| {
        let (tx, rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        tokio::spawn(run_writer(session_id.to_owned(), stdin, rx, kill.clone()));
        tx
    });

    {
        let kill = kill.clone();
        let session_id = session_id.to_owned();
        tokio::spawn(async move {
            let stdout_task = tokio::spawn(forward_lines(
                stdout,
                generation,
                events.clone(),
                ProcessSignal::Stdout,
            ));
            let stderr_task = tokio::spawn(forward_lines(
                stderr,
                generation,
                events.clone(),
                ProcessSignal::Stderr,
            ));
            let stdout_abort = stdout_task.abort_handle();
            let stderr_abort = stderr_task.abort_handle();

            let status = tokio::select! {
                status = child.wait() => status,
                () = kill.cancelled() => {
                    warn!(session_id, pid, "force-killing agent process");
                    if let Err(err) = child.start_kill() {
                        warn!(session_id, pid, %err, "failed to force-kill agent process");
                    }
                    child.wait().await
                }
            };
            let exit = ProcessExit::from_status(status);

            let drained = tokio::time::timeout(READER_DRAIN, async {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
            })
            .await;
            if drained.is_err() {
                warn!(session_id, pid, "agent output still open after exit; abandoning readers");
                stdout_abort.abort();
                stderr_abort.abort();
            }

            info!(session_id, pid, generation, status = %exit.describe(), "agent process exited");
            let _ = events.send(ProcessMessage {
                generation,
                signal: ProcessSignal::Exited(exit),
            });
        });
    }

    Ok(AttachedProcess {
        generation,
        pid,
        input,
        kill,
    })
}

/// Forward decoded lines until EOF or a fatal read error.
async fn forward_lines<R>(
    reader: R,
    generation: u64,
    events: mpsc::UnboundedSender<ProcessMessage>,
    wrap: fn(String) -> ProcessSignal,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, AgentCodec::new());
    while let Some(item) = framed.next().await {
        match item {
            Ok(line) => {
                let message = ProcessMessage {
                    generation,
                    signal: wrap(line),
                };
                if events.send(message).is_err() {
                    debug!(generation, "process output receiver dropped, stopping reader");
                    break;
                }
            }
            Err(AppError::Parse(msg)) => {
                warn!(generation, error = %msg, "agent output framing error, skipping line");
            }
            Err(err) => {
                warn!(generation, error = %err, "agent output read error, stopping reader");
                break;
            }
        }
    }
}

/// Serialize queued JSON messages onto the child's stdin as NDJSON.
///
/// Exits when the sender side is dropped (closing stdin), on cancellation,
/// or on the first write failure.
async fn run_writer(
    session_id: String,
    mut stdin: ChildStdin,
    mut input: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            msg = input.recv() => {
                let Some(value) = msg else {
                    debug!(session_id, "agent input closed, closing stdin");
                    break;
                };
                let mut bytes = match serde_json::to_vec(&value) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(session_id, %err, "failed to serialise agent input");
                        continue;
                    }
                };
                bytes.push(b'\n');
                let written = async {
                    stdin.write_all(&bytes).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(err) = written {
                    warn!(session_id, %err, "write to agent stdin failed");
                    break;
                }
            }
        }
    }
}
