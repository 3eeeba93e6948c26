//! Session runner: one agent session driven to a terminal status.
//!
//! A [`SessionRunner`] is a cheap, clonable handle. The first
//! [`SessionRunner::start`] call spawns the driver task that owns the
//! session's state machine; every other method talks to that task through
//! channels or reads the shared event hub.

mod driver;
pub mod hub;
pub mod strategy;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RunnerConfig;
use crate::models::event::DoneInfo;
use crate::models::session::{RunnerPhase, SessionMetadata};
use crate::persistence::paths::SessionPaths;
use crate::{AppError, Result};

use driver::{Completion, Driver, DriverParts, RunnerCommand};
use hub::{EventHub, Subscription};
use strategy::TurnStrategy;

/// Capacity of the command channel between handle and driver.
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Limits and timers applied to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Global lifetime measured from `start()`.
    pub session_timeout: Duration,
    /// Upper bound for one turn.
    pub turn_timeout: Duration,
    /// Grace between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Keepalive period on subscriber streams.
    pub keepalive: Duration,
    /// Event cap; the event with this id is the synthetic limit error.
    pub max_events: u64,
}

impl RunnerSettings {
    /// Settings derived from the runner configuration.
    #[must_use]
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            session_timeout: config.session_timeout(),
            turn_timeout: config.turn_timeout(),
            kill_grace: config.kill_grace(),
            keepalive: config.keepalive(),
            max_events: config.max_events,
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

struct Inner {
    session_id: String,
    project_id: String,
    settings: RunnerSettings,
    pending: Mutex<Option<Driver>>,
    commands: mpsc::Sender<RunnerCommand>,
    stop: CancellationToken,
    phase: watch::Receiver<RunnerPhase>,
    hub: Arc<EventHub>,
    completion: Arc<Completion>,
}

/// Handle to one session's runner.
#[derive(Clone)]
pub struct SessionRunner {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRunner")
            .field("session_id", &self.inner.session_id)
            .field("project_id", &self.inner.project_id)
            .field("phase", &*self.inner.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionRunner {
    /// Build a runner for `meta`. Nothing touches disk or spawns until
    /// [`SessionRunner::start`].
    #[must_use]
    pub fn new(
        meta: SessionMetadata,
        paths: SessionPaths,
        strategy: Box<dyn TurnStrategy>,
        settings: RunnerSettings,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (phase_tx, phase_rx) = watch::channel(RunnerPhase::Processing);
        let hub = Arc::new(EventHub::new());
        let completion = Arc::new(Completion::new());
        let stop = CancellationToken::new();

        let session_id = meta.id.clone();
        let project_id = meta.project_id.clone();
        let driver = Driver::new(DriverParts {
            meta,
            paths,
            strategy,
            settings,
            hub: Arc::clone(&hub),
            phase_tx,
            completion: Arc::clone(&completion),
            commands: command_rx,
            stop: stop.clone(),
        });

        Self {
            inner: Arc::new(Inner {
                session_id,
                project_id,
                settings,
                pending: Mutex::new(Some(driver)),
                commands: command_tx,
                stop,
                phase: phase_rx,
                hub,
                completion,
            }),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Owning project identifier.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    /// Spawn the driver task. Later calls are no-ops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let driver = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match driver {
            Some(driver) => {
                tokio::spawn(driver.run());
            }
            None => debug!(session_id = %self.inner.session_id, "runner already started"),
        }
    }

    /// Request termination with status `stopped`. Idempotent; a runner that
    /// was never started ends immediately.
    pub fn stop(&self) {
        let pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some(driver) => driver.abandon(),
            None => self.inner.stop.cancel(),
        }
    }

    /// Deliver a follow-up turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotIdle` unless the runner is idle between turns.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        if self.phase() != RunnerPhase::Idle {
            return Err(self.not_idle());
        }
        let (reply, outcome) = oneshot::channel();
        self.inner
            .commands
            .send(RunnerCommand::Send {
                text: text.to_owned(),
                reply,
            })
            .await
            .map_err(|_| self.not_idle())?;
        outcome.await.map_err(|_| self.not_idle())?
    }

    fn not_idle(&self) -> AppError {
        AppError::NotIdle(format!(
            "session {} is not waiting for input",
            self.inner.session_id
        ))
    }

    /// Current runner phase.
    #[must_use]
    pub fn phase(&self) -> RunnerPhase {
        *self.inner.phase.borrow()
    }

    /// Wait until the runner is idle or has ended, returning that phase.
    pub async fn wait_settled(&self) -> RunnerPhase {
        let mut phase = self.inner.phase.clone();
        let settled = match phase
            .wait_for(|p| matches!(p, RunnerPhase::Idle | RunnerPhase::Ended))
            .await
        {
            Ok(settled) => *settled,
            Err(_) => RunnerPhase::Ended,
        };
        settled
    }

    /// Wait for the terminal signal.
    pub async fn wait(&self) -> DoneInfo {
        let mut done = self.inner.completion.subscribe();
        loop {
            if let Some(info) = done.borrow_and_update().clone() {
                return info;
            }
            if done.changed().await.is_err() {
                // The sender lives in `Inner`, which `self` keeps alive.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Terminal signal, if the session has ended.
    #[must_use]
    pub fn outcome(&self) -> Option<DoneInfo> {
        self.inner.completion.subscribe().borrow().clone()
    }

    /// Replay events from `offset`, then follow live until done.
    #[must_use]
    pub fn subscribe(&self, offset: u64) -> Subscription {
        self.inner.hub.subscribe(offset, self.inner.settings.keepalive)
    }

    /// Run `listener` once when the session ends (immediately if it already has).
    pub fn on_complete(&self, listener: impl FnOnce(&DoneInfo) + Send + 'static) {
        self.inner.completion.listen(Box::new(listener));
    }
}
