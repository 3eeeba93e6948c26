//! On-disk layout helpers.

use std::path::{Path, PathBuf};

use crate::{AppError, Result};

const SESSIONS_DIR: &str = "sessions";
const META_FILE: &str = "meta.json";
const EVENTS_FILE: &str = "events.jsonl";
const PROJECT_FILE: &str = "project.json";

/// Paths owned by a single session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    dir: PathBuf,
}

impl SessionPaths {
    /// Resolve the directory for `session_id` under `project_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if either id could escape the data directory.
    pub fn new(data_dir: &Path, project_id: &str, session_id: &str) -> Result<Self> {
        validate_component("project_id", project_id)?;
        validate_component("session_id", session_id)?;
        Ok(Self {
            dir: data_dir.join(project_id).join(SESSIONS_DIR).join(session_id),
        })
    }

    /// Build from a directory that already exists on disk (used by the recovery scan).
    #[must_use]
    pub fn from_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Session directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `meta.json`.
    #[must_use]
    pub fn metadata(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    /// `events.jsonl`.
    #[must_use]
    pub fn events(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }
}

/// `<data_dir>/<project_id>/project.json`.
///
/// # Errors
///
/// Returns `AppError::Config` if `project_id` is not a plain path component.
pub fn project_file(data_dir: &Path, project_id: &str) -> Result<PathBuf> {
    validate_component("project_id", project_id)?;
    Ok(data_dir.join(project_id).join(PROJECT_FILE))
}

/// Every session directory currently present under `data_dir`.
///
/// Missing or unreadable directories yield an empty list for that branch.
#[must_use]
pub fn scan_session_dirs(data_dir: &Path) -> Vec<SessionPaths> {
    let mut found = Vec::new();
    let Ok(projects) = std::fs::read_dir(data_dir) else {
        return found;
    };
    for project in projects.flatten() {
        let sessions_dir = project.path().join(SESSIONS_DIR);
        let Ok(sessions) = std::fs::read_dir(&sessions_dir) else {
            continue;
        };
        for session in sessions.flatten() {
            let path = session.path();
            if path.is_dir() {
                found.push(SessionPaths::from_dir(path));
            }
        }
    }
    found.sort_by(|a, b| a.dir.cmp(&b.dir));
    found
}

fn validate_component(label: &str, value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(AppError::Config(format!("invalid {label}: {value:?}")))
    }
}
