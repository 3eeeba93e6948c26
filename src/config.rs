//! Runner configuration parsing and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::models::session::StrategyKind;
use crate::{AppError, Result};

/// Environment variable that overrides [`RunnerConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "SESSION_RUNNER_DATA_DIR";

/// Timeout values (seconds) bounding sessions, turns, and shutdown.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Global session lifetime measured from `start()`.
    #[serde(default = "default_session_seconds")]
    pub session_seconds: u64,
    /// Upper bound for a single turn.
    #[serde(default = "default_turn_seconds")]
    pub turn_seconds: u64,
    /// Grace window between SIGTERM and SIGKILL.
    #[serde(default = "default_kill_grace_seconds")]
    pub kill_grace_seconds: u64,
    /// Keepalive period on open subscriber streams.
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            session_seconds: default_session_seconds(),
            turn_seconds: default_turn_seconds(),
            kill_grace_seconds: default_kill_grace_seconds(),
            keepalive_seconds: default_keepalive_seconds(),
        }
    }
}

fn default_session_seconds() -> u64 {
    30 * 60
}

fn default_turn_seconds() -> u64 {
    10 * 60
}

fn default_kill_grace_seconds() -> u64 {
    10
}

fn default_keepalive_seconds() -> u64 {
    15
}

/// How the agent CLI is invoked.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent binary (e.g. `claude`).
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Arguments for a persistent stream-json process (streaming strategy).
    #[serde(default = "default_streaming_args")]
    pub streaming_args: Vec<String>,
    /// Arguments for a one-shot process (resume strategy); the prompt is appended last.
    #[serde(default = "default_resume_args")]
    pub resume_args: Vec<String>,
    /// Flag preceding the continuation token on resumed turns.
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
    /// Working directory for the agent process; inherits the server's when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Strategy used when the caller does not pick one.
    #[serde(default)]
    pub default_strategy: StrategyKind,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            streaming_args: default_streaming_args(),
            resume_args: default_resume_args(),
            resume_flag: default_resume_flag(),
            working_dir: None,
            default_strategy: StrategyKind::default(),
        }
    }
}

fn default_binary() -> String {
    "claude".into()
}

fn default_streaming_args() -> Vec<String> {
    [
        "-p",
        "--verbose",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn default_resume_args() -> Vec<String> {
    ["-p", "--verbose", "--output-format", "stream-json"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_resume_flag() -> String {
    "--resume".into()
}

fn default_max_concurrent_sessions() -> usize {
    3
}

fn default_max_events() -> u64 {
    5000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".sessions")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunnerConfig {
    /// Root directory holding per-project session folders.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Ceiling on concurrently registered sessions.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Hard cap on events per session before forced termination.
    #[serde(default = "default_max_events")]
    pub max_events: u64,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Agent CLI invocation.
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            max_events: default_max_events(),
            timeouts: TimeoutConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Replace `data_dir` with [`DATA_DIR_ENV`] when it is set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                info!(data_dir = %dir, "data_dir overridden from environment");
                self.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Global session lifetime.
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.session_seconds)
    }

    /// Per-turn timeout.
    #[must_use]
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.turn_seconds)
    }

    /// SIGTERM → SIGKILL grace window.
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.kill_grace_seconds)
    }

    /// Keepalive period for subscriber streams.
    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.timeouts.keepalive_seconds)
    }

    /// Validate invariants that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "max_concurrent_sessions must be greater than zero".into(),
            ));
        }
        if self.max_events == 0 {
            return Err(AppError::Config("max_events must be greater than zero".into()));
        }
        if self.agent.binary.trim().is_empty() {
            return Err(AppError::Config("agent.binary must not be empty".into()));
        }
        if self.timeouts.session_seconds == 0 || self.timeouts.turn_seconds == 0 {
            return Err(AppError::Config(
                "session and turn timeouts must be greater than zero".into(),
            ));
        }
        if self.timeouts.keepalive_seconds == 0 {
            return Err(AppError::Config(
                "keepalive_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
