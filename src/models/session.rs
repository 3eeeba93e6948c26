//! Session metadata record and lifecycle enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status for an agent session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session admitted and owned by a live runner.
    Running,
    /// Session ended normally.
    ///
    /// Runners never record this: every runner ending is a stop, a timeout,
    /// or a failure. It is accepted on read and left untouched by recovery.
    Completed,
    /// Session ended because of a spawn error, protocol violation, or resource cap.
    Failed,
    /// Session ended on explicit request.
    Stopped,
    /// Session ended because a turn or the session outlived its timeout.
    #[serde(rename = "timed-out", alias = "timed_out")]
    TimedOut,
}

impl SessionStatus {
    /// Whether the status is final; terminal records are never rewritten.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Runner mode persisted alongside the status so recovery can tell whether a
/// process was attached when the server went down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunnerPhase {
    /// No turn in flight; follow-up messages are accepted.
    Idle,
    /// A turn is being worked by an attached process.
    #[default]
    Processing,
    /// Terminal; no further transitions.
    Ended,
}

/// How turns map onto OS processes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// One persistent process; turns end on a `result` event.
    #[default]
    Streaming,
    /// One process per turn, chained through a continuation token.
    Resume,
}

impl std::str::FromStr for StrategyKind {
    type Err = crate::AppError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "streaming" => Ok(Self::Streaming),
            "resume" => Ok(Self::Resume),
            other => Err(crate::AppError::Config(format!(
                "unknown strategy '{other}' (expected streaming or resume)"
            ))),
        }
    }
}

/// Durable projection of a session, rewritten wholesale on every transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionMetadata {
    /// Unique session identifier.
    pub id: String,
    /// Owning project identifier.
    pub project_id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Runner mode at the time of the last write.
    #[serde(default)]
    pub mode: RunnerPhase,
    /// Execution strategy.
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Initial prompt.
    #[serde(default)]
    pub prompt: String,
    /// When `start()` was called.
    pub started_at: DateTime<Utc>,
    /// When the session became terminal.
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds, set once terminal.
    pub duration_ms: Option<u64>,
    /// Number of events appended to the log.
    pub event_count: u64,
    /// Number of turns begun, including the first.
    #[serde(default)]
    pub turn_count: u32,
    /// Exit code of the most recent process.
    pub exit_code: Option<i32>,
    /// Last error message.
    pub error: Option<String>,
    /// PID of the currently attached process.
    pub pid: Option<u32>,
    /// Agent-side session identifier used to resume conversation context.
    #[serde(default)]
    pub continuation_token: Option<String>,
}

impl SessionMetadata {
    /// Construct a fresh `running` record.
    #[must_use]
    pub fn new(id: String, project_id: String, prompt: String, strategy: StrategyKind) -> Self {
        Self {
            id,
            project_id,
            status: SessionStatus::Running,
            mode: RunnerPhase::Processing,
            strategy,
            prompt,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            event_count: 0,
            turn_count: 0,
            exit_code: None,
            error: None,
            pid: None,
            continuation_token: None,
        }
    }

    /// Stamp the terminal fields: status, end time, duration, cleared pid.
    pub fn finish(&mut self, status: SessionStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.mode = RunnerPhase::Ended;
        self.ended_at = Some(now);
        let elapsed = (now - self.started_at).num_milliseconds().max(0);
        self.duration_ms = Some(u64::try_from(elapsed).unwrap_or_default());
        self.pid = None;
        if error.is_some() {
            self.error = error;
        }
    }
}
