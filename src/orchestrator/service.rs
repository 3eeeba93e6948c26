//! Command surface used by the route layer and the CLI.
//!
//! [`SessionService`] ties configuration, the registry, the recovery sweep,
//! and on-disk replay together. Construct it with
//! [`SessionService::bootstrap`], which runs recovery before any session can
//! be admitted.

use std::fs;

use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::models::event::DoneInfo;
use crate::models::session::{SessionMetadata, StrategyKind};
use crate::orchestrator::recovery::{recover_sessions, RecoveryReport};
use crate::orchestrator::session_manager::SessionManager;
use crate::persistence::event_log::read_events;
use crate::persistence::metadata::read_metadata;
use crate::persistence::paths::SessionPaths;
use crate::persistence::project_index::ProjectIndex;
use crate::runner::hub::Subscription;
use crate::runner::strategy::strategy_for;
use crate::runner::{RunnerSettings, SessionRunner};
use crate::{AppError, Result};

/// Where a subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayFrom {
    /// From the first event.
    #[default]
    Start,
    /// From an explicit offset.
    Offset(u64),
    /// After the last event the viewer saw.
    After(u64),
}

impl ReplayFrom {
    /// Resolve request inputs: an explicit offset wins, then the last seen
    /// event id, then the start of the log. An unparseable id is ignored.
    #[must_use]
    pub fn resolve(offset: Option<u64>, last_event_id: Option<&str>) -> Self {
        if let Some(offset) = offset {
            return Self::Offset(offset);
        }
        match last_event_id.map(str::trim) {
            Some(raw) if !raw.is_empty() => match raw.parse::<u64>() {
                Ok(id) => Self::After(id),
                Err(_) => {
                    warn!(last_event_id = raw, "ignoring non-numeric last event id");
                    Self::Start
                }
            },
            _ => Self::Start,
        }
    }

    /// First event id to deliver.
    #[must_use]
    pub fn offset(self) -> u64 {
        match self {
            Self::Start => 0,
            Self::Offset(offset) => offset,
            Self::After(id) => id.saturating_add(1),
        }
    }
}

/// Session commands backed by the registry and the data directory.
#[derive(Debug, Clone)]
pub struct SessionService {
    config: RunnerConfig,
    settings: RunnerSettings,
    manager: SessionManager,
    projects: ProjectIndex,
    recovery: RecoveryReport,
}

impl SessionService {
    /// Create the data directory, run the recovery sweep, and return a
    /// service ready to admit sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the data directory cannot be created.
    pub fn bootstrap(config: RunnerConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create data dir {}: {err}",
                config.data_dir.display()
            ))
        })?;
        let projects = ProjectIndex::new(config.data_dir.clone());
        let recovery = recover_sessions(&config.data_dir, &projects);
        Ok(Self {
            settings: RunnerSettings::from_config(&config),
            manager: SessionManager::new(config.max_concurrent_sessions),
            projects,
            recovery,
            config,
        })
    }

    /// Report from the startup recovery sweep.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Underlying registry.
    #[must_use]
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Admit and start a session for `project_id`, returning its id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an unusable project id,
    /// `AppError::AlreadyRunning`, or `AppError::CapacityExceeded`. Nothing
    /// is written to disk and no process is spawned on error.
    pub fn start_session(
        &self,
        project_id: &str,
        prompt: &str,
        strategy: Option<StrategyKind>,
    ) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let span = info_span!("start_session", project_id, session_id = %session_id);
        let _guard = span.enter();

        let kind = strategy.unwrap_or(self.config.agent.default_strategy);
        let paths = SessionPaths::new(&self.config.data_dir, project_id, &session_id)?;
        let meta = SessionMetadata::new(
            session_id.clone(),
            project_id.to_owned(),
            prompt.to_owned(),
            kind,
        );
        let runner = SessionRunner::new(
            meta,
            paths,
            strategy_for(kind, &self.config.agent),
            self.settings,
        );

        self.manager
            .try_start_session(&session_id, project_id, runner.clone())?;

        if let Err(err) = self.projects.set_active(project_id, &session_id) {
            warn!(%err, "failed to record active session for project");
        }
        let projects = self.projects.clone();
        let (sid, pid) = (session_id.clone(), project_id.to_owned());
        runner.on_complete(move |_| {
            if let Err(err) = projects.clear_active(&pid, &sid) {
                warn!(project_id = %pid, session_id = %sid, %err, "failed to clear active session");
            }
        });

        runner.start();
        info!(strategy = ?kind, "session started");
        Ok(session_id)
    }

    /// Deliver a follow-up message to a running session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not registered, or
    /// `AppError::NotIdle` if a turn is in flight.
    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<()> {
        let runner = self.running(session_id)?;
        runner.send_message(text).await
    }

    /// Request a graceful stop.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not registered.
    pub fn stop_session(&self, session_id: &str) -> Result<()> {
        if self.manager.stop_session(session_id) {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("session {session_id} is not running")))
        }
    }

    /// Subscribe to a session's events.
    ///
    /// A registered session replays from memory and then follows live; any
    /// other session is replayed from its log and closed with `done` built
    /// from its metadata.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session has no metadata, or
    /// `AppError::Persistence` if its files cannot be read.
    pub fn subscribe(
        &self,
        project_id: &str,
        session_id: &str,
        from: ReplayFrom,
    ) -> Result<Subscription> {
        let offset = from.offset();
        if let Some(runner) = self.manager.get(session_id) {
            if runner.project_id() == project_id {
                return Ok(runner.subscribe(offset));
            }
        }

        let paths = SessionPaths::new(&self.config.data_dir, project_id, session_id)?;
        let meta = read_metadata(&paths.metadata())?;
        let events = read_events(&paths.events(), offset)?;
        let done = DoneInfo {
            status: meta.status,
            duration_ms: meta.duration_ms,
            error: meta.error,
        };
        Ok(Subscription::finished(
            events,
            offset,
            done,
            self.settings.keepalive,
        ))
    }

    /// Persisted metadata for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session has no metadata.
    pub fn session_metadata(&self, project_id: &str, session_id: &str) -> Result<SessionMetadata> {
        let paths = SessionPaths::new(&self.config.data_dir, project_id, session_id)?;
        read_metadata(&paths.metadata())
    }

    /// Stop every running session and wait for them to end.
    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
    }

    fn running(&self, session_id: &str) -> Result<SessionRunner> {
        self.manager
            .get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} is not running")))
    }
}
