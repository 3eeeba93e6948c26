//! Turn strategies: how a conversational turn maps onto OS processes.
//!
//! The driver owns the shared turn/timeout/kill logic; a [`TurnStrategy`]
//! only decides how a turn is launched or delivered and what a `result`
//! event or a process exit means.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::agent::parser::user_message;
use crate::agent::process::{spawn_process, AttachedProcess, ProcessExit, ProcessMessage, ProcessSpec};
use crate::config::AgentConfig;
use crate::models::session::{SessionStatus, StrategyKind};
use crate::{AppError, Result};

/// Context needed to spawn a process on behalf of a session.
#[derive(Debug)]
pub struct Launch<'a> {
    /// Runner session id, exported to the agent environment.
    pub session_id: &'a str,
    /// Generation tag for the process about to be spawned.
    pub generation: u64,
    /// Channel receiving the process's output and exit.
    pub events: &'a mpsc::UnboundedSender<ProcessMessage>,
}

/// What a `result` event means for the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnBoundary {
    /// The turn is over; the runner returns to `idle`.
    EndTurn,
    /// The turn ends when the process exits.
    AwaitExit,
}

/// What a process exit (with no termination pending) means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDisposition {
    /// The turn completed; the session continues.
    TurnEnded,
    /// The turn failed; the session continues and the error is recorded.
    TurnFailed(String),
    /// The session is over.
    SessionEnded {
        /// Final status.
        status: SessionStatus,
        /// Final error message.
        error: Option<String>,
    },
}

/// Strategy extension points used by the runner driver.
pub trait TurnStrategy: Send + Sync + std::fmt::Debug {
    /// Which strategy this is.
    fn kind(&self) -> StrategyKind;

    /// Launch the process for the first turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the process cannot be launched, or
    /// `AppError::Protocol` if the prompt cannot be delivered to it.
    fn spawn_turn(
        &self,
        launch: &Launch<'_>,
        prompt: &str,
        continuation: Option<&str>,
    ) -> Result<AttachedProcess>;

    /// Deliver a follow-up message. Returns a newly spawned process when the
    /// strategy launches one per turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` or `AppError::Protocol` as for
    /// [`TurnStrategy::spawn_turn`].
    fn deliver_message(
        &self,
        launch: &Launch<'_>,
        attached: Option<&AttachedProcess>,
        text: &str,
        continuation: Option<&str>,
    ) -> Result<Option<AttachedProcess>>;

    /// Called when the agent emits a `result` record.
    fn on_turn_result(&self) -> TurnBoundary;

    /// Called when the attached process exits and no stop is pending.
    fn on_process_exit(&self, exit: &ProcessExit, kill_requested: bool) -> ExitDisposition;
}

/// Build the strategy for `kind` from the agent configuration.
#[must_use]
pub fn strategy_for(kind: StrategyKind, agent: &AgentConfig) -> Box<dyn TurnStrategy> {
    match kind {
        StrategyKind::Streaming => Box::new(StreamingStrategy::from_config(agent)),
        StrategyKind::Resume => Box::new(ResumeStrategy::from_config(agent)),
    }
}

// ── Streaming ────────────────────────────────────────────────────────────────

/// One persistent process per session; turns are delimited by `result`.
#[derive(Debug, Clone)]
pub struct StreamingStrategy {
    binary: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl StreamingStrategy {
    /// Strategy invoking `binary` with `args`.
    #[must_use]
    pub fn new(binary: impl Into<String>, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args,
            working_dir,
        }
    }

    /// Strategy using `[agent] binary` and `streaming_args`.
    #[must_use]
    pub fn from_config(agent: &AgentConfig) -> Self {
        Self::new(
            agent.binary.clone(),
            agent.streaming_args.clone(),
            agent.working_dir.clone(),
        )
    }
}

impl TurnStrategy for StreamingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Streaming
    }

    fn spawn_turn(
        &self,
        launch: &Launch<'_>,
        prompt: &str,
        _continuation: Option<&str>,
    ) -> Result<AttachedProcess> {
        let spec = ProcessSpec {
            binary: self.binary.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            pipe_stdin: true,
        };
        let process = spawn_process(&spec, launch.session_id, launch.generation, launch.events.clone())?;
        if let Err(err) = process.send_input(user_message(prompt)) {
            process.force_kill();
            return Err(err);
        }
        Ok(process)
    }

    fn deliver_message(
        &self,
        _launch: &Launch<'_>,
        attached: Option<&AttachedProcess>,
        text: &str,
        _continuation: Option<&str>,
    ) -> Result<Option<AttachedProcess>> {
        let process = attached
            .ok_or_else(|| AppError::Protocol("no agent process attached".into()))?;
        process.send_input(user_message(text))?;
        Ok(None)
    }

    fn on_turn_result(&self) -> TurnBoundary {
        TurnBoundary::EndTurn
    }

    fn on_process_exit(&self, exit: &ProcessExit, kill_requested: bool) -> ExitDisposition {
        if kill_requested {
            return ExitDisposition::SessionEnded {
                status: SessionStatus::Stopped,
                error: None,
            };
        }
        ExitDisposition::SessionEnded {
            status: SessionStatus::Failed,
            error: Some(format!("agent process {} unexpectedly", exit.describe())),
        }
    }
}

// ── Resume ───────────────────────────────────────────────────────────────────

/// One process per turn, chained through the agent's continuation token.
#[derive(Debug, Clone)]
pub struct ResumeStrategy {
    binary: String,
    args: Vec<String>,
    resume_flag: String,
    working_dir: Option<PathBuf>,
}

impl ResumeStrategy {
    /// Strategy invoking `binary` with `args`, then `resume_flag <token>`, then the prompt.
    #[must_use]
    pub fn new(
        binary: impl Into<String>,
        args: Vec<String>,
        resume_flag: impl Into<String>,
        working_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            args,
            resume_flag: resume_flag.into(),
            working_dir,
        }
    }

    /// Strategy using `[agent] binary`, `resume_args`, and `resume_flag`.
    #[must_use]
    pub fn from_config(agent: &AgentConfig) -> Self {
        Self::new(
            agent.binary.clone(),
            agent.resume_args.clone(),
            agent.resume_flag.clone(),
            agent.working_dir.clone(),
        )
    }

    /// Argument vector for one turn.
    #[must_use]
    pub fn turn_args(&self, prompt: &str, continuation: Option<&str>) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(token) = continuation {
            args.push(self.resume_flag.clone());
            args.push(token.to_owned());
        }
        args.push(prompt.to_owned());
        args
    }
}

impl TurnStrategy for ResumeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Resume
    }

    fn spawn_turn(
        &self,
        launch: &Launch<'_>,
        prompt: &str,
        continuation: Option<&str>,
    ) -> Result<AttachedProcess> {
        let spec = ProcessSpec {
            binary: self.binary.clone(),
            args: self.turn_args(prompt, continuation),
            working_dir: self.working_dir.clone(),
            pipe_stdin: false,
        };
        spawn_process(&spec, launch.session_id, launch.generation, launch.events.clone())
    }

    fn deliver_message(
        &self,
        launch: &Launch<'_>,
        _attached: Option<&AttachedProcess>,
        text: &str,
        continuation: Option<&str>,
    ) -> Result<Option<AttachedProcess>> {
        self.spawn_turn(launch, text, continuation).map(Some)
    }

    fn on_turn_result(&self) -> TurnBoundary {
        TurnBoundary::AwaitExit
    }

    fn on_process_exit(&self, exit: &ProcessExit, kill_requested: bool) -> ExitDisposition {
        if exit.success() || kill_requested {
            ExitDisposition::TurnEnded
        } else {
            ExitDisposition::TurnFailed(format!("agent turn {}", exit.describe()))
        }
    }
}
