//! Startup sweep reconciling persisted `running` sessions after a restart.
//!
//! No runner survives a restart, so every `running` record on disk is stale.
//! A record last written while idle ends as `stopped`; one written while a
//! process was attached ends as `failed`. Terminal records are left alone.

use std::path::Path;

use chrono::Utc;
use tracing::{info, info_span, warn};

use crate::models::session::{RunnerPhase, SessionStatus};
use crate::persistence::event_log::read_events;
use crate::persistence::metadata::{read_metadata, write_metadata};
use crate::persistence::paths::scan_session_dirs;
use crate::persistence::project_index::ProjectIndex;

/// Error recorded for sessions that were idle between turns.
pub const IDLE_RESTART_ERROR: &str = "server restarted between turns";

/// Error recorded for sessions that had a process attached.
pub const PROCESSING_RESTART_ERROR: &str = "server restarted while the agent process was running";

/// Outcome of one recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Session directories examined.
    pub scanned: usize,
    /// Sessions finalized as `stopped`.
    pub stopped: Vec<String>,
    /// Sessions finalized as `failed`.
    pub failed: Vec<String>,
    /// Directories whose metadata could not be read or rewritten.
    pub errors: usize,
}

impl RecoveryReport {
    /// Number of sessions rewritten.
    #[must_use]
    pub fn recovered(&self) -> usize {
        self.stopped.len() + self.failed.len()
    }
}

/// Finalize every stale `running` session under `data_dir`.
///
/// Failures on individual sessions are logged and counted; the sweep always
/// visits every directory.
#[must_use]
pub fn recover_sessions(data_dir: &Path, projects: &ProjectIndex) -> RecoveryReport {
    let span = info_span!("recover_sessions", data_dir = %data_dir.display());
    let _guard = span.enter();

    let mut report = RecoveryReport::default();
    for paths in scan_session_dirs(data_dir) {
        report.scanned += 1;
        let mut meta = match read_metadata(&paths.metadata()) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(dir = %paths.dir().display(), %err, "skipping unreadable session");
                report.errors += 1;
                continue;
            }
        };
        if meta.status.is_terminal() {
            continue;
        }

        let (status, error) = if meta.mode == RunnerPhase::Idle {
            (SessionStatus::Stopped, IDLE_RESTART_ERROR)
        } else {
            (SessionStatus::Failed, PROCESSING_RESTART_ERROR)
        };
        // The count is only persisted on transitions; the log may be ahead.
        match read_events(&paths.events(), meta.event_count) {
            Ok(events) => {
                if let Some(last) = events.last() {
                    meta.event_count = meta.event_count.max(last.id.saturating_add(1));
                }
            }
            Err(err) => warn!(session_id = %meta.id, %err, "failed to recount logged events"),
        }
        meta.finish(status, Some(error.to_owned()), Utc::now());

        if let Err(err) = write_metadata(&paths.metadata(), &meta) {
            warn!(session_id = %meta.id, %err, "failed to persist recovered session");
            report.errors += 1;
            continue;
        }
        match projects.clear_active(&meta.project_id, &meta.id) {
            Ok(true) => info!(project_id = %meta.project_id, session_id = %meta.id, "cleared stale active session"),
            Ok(false) => {}
            Err(err) => warn!(project_id = %meta.project_id, %err, "failed to clear project back-reference"),
        }

        info!(session_id = %meta.id, ?status, "recovered session");
        match status {
            SessionStatus::Stopped => report.stopped.push(meta.id),
            _ => report.failed.push(meta.id),
        }
    }

    info!(
        scanned = report.scanned,
        recovered = report.recovered(),
        errors = report.errors,
        "recovery sweep complete"
    );
    report
}
