//! Process-wide session registry: admission, lookup, and shutdown.
//!
//! Two maps live behind one lock: session id → runner and project id →
//! session id. Admission checks both limits and registers both entries in a
//! single critical section. Entries are removed only by the completion
//! listener attached at admission.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tracing::{info, info_span, warn};

use crate::runner::SessionRunner;
use crate::{AppError, Result};

#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<String, SessionRunner>,
    projects: HashMap<String, String>,
}

/// Registry enforcing one session per project and a global ceiling.
#[derive(Debug, Clone)]
pub struct SessionManager {
    registry: Arc<Mutex<Registry>>,
    max_concurrent: usize,
}

impl SessionManager {
    /// Empty registry admitting at most `max_concurrent` sessions.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            max_concurrent,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically admit `runner` for `project_id`.
    ///
    /// On success both maps hold the session until the runner reports
    /// completion. The runner is not started here.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyRunning` if the project already has a
    /// registered session, or `AppError::CapacityExceeded` if the ceiling is
    /// reached. Nothing is registered on error.
    pub fn try_start_session(
        &self,
        session_id: &str,
        project_id: &str,
        runner: SessionRunner,
    ) -> Result<()> {
        let span = info_span!("try_start_session", session_id, project_id);
        let _guard = span.enter();

        {
            let mut registry = self.lock();
            if let Some(existing) = registry.projects.get(project_id) {
                return Err(AppError::AlreadyRunning(format!(
                    "project {project_id} already has session {existing}"
                )));
            }
            if registry.sessions.len() >= self.max_concurrent {
                return Err(AppError::CapacityExceeded(format!(
                    "{} of {} sessions running",
                    registry.sessions.len(),
                    self.max_concurrent
                )));
            }
            registry
                .sessions
                .insert(session_id.to_owned(), runner.clone());
            registry
                .projects
                .insert(project_id.to_owned(), session_id.to_owned());
        }

        // Attached outside the lock: an already-ended runner calls back inline.
        let registry = Arc::clone(&self.registry);
        let (sid, pid) = (session_id.to_owned(), project_id.to_owned());
        runner.on_complete(move |done| {
            let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.sessions.remove(&sid);
            if registry.projects.get(&pid) == Some(&sid) {
                registry.projects.remove(&pid);
            }
            info!(session_id = %sid, project_id = %pid, status = ?done.status, "session released");
        });

        info!(
            max_concurrent = self.max_concurrent,
            "session admitted"
        );
        Ok(())
    }

    /// Runner registered under `session_id`.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionRunner> {
        self.lock().sessions.get(session_id).cloned()
    }

    /// Session id currently owning `project_id`.
    #[must_use]
    pub fn session_for_project(&self, project_id: &str) -> Option<String> {
        self.lock().projects.get(project_id).cloned()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Request a stop. Returns `false` when the session is not registered.
    pub fn stop_session(&self, session_id: &str) -> bool {
        let runner = self.get(session_id);
        match runner {
            Some(runner) => {
                info!(session_id, "stop requested");
                runner.stop();
                true
            }
            None => {
                warn!(session_id, "stop requested for unknown session");
                false
            }
        }
    }

    /// Stop every registered runner and wait until each reports completion.
    pub async fn stop_all(&self) {
        let runners: Vec<SessionRunner> = self.lock().sessions.values().cloned().collect();
        if runners.is_empty() {
            return;
        }
        info!(count = runners.len(), "stopping all sessions");
        for runner in &runners {
            runner.stop();
        }
        join_all(runners.iter().map(SessionRunner::wait)).await;
        info!("all sessions stopped");
    }
}
