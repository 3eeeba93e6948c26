//! Project-level back-reference to the session currently running for it.
//!
//! The project store proper lives outside this crate; this file only keeps
//! `active_session_id` so a dashboard can find the live session and so the
//! recovery sweep can clear references to sessions that died with the server.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::persistence::paths::project_file;
use crate::{AppError, Result};

/// Contents of `project.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectLink {
    /// Session currently registered as running for the project.
    #[serde(default)]
    pub active_session_id: Option<String>,
}

/// Reads and writes `project.json` files under a data directory.
///
/// Clones share one lock, so read-modify-write updates never interleave.
#[derive(Debug, Clone)]
pub struct ProjectIndex {
    data_dir: PathBuf,
    update: Arc<Mutex<()>>,
}

impl ProjectIndex {
    /// Index rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            update: Arc::new(Mutex::new(())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.update.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current link for `project_id`; a missing file is an empty link.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the file exists but is unreadable.
    pub fn load(&self, project_id: &str) -> Result<ProjectLink> {
        let path = project_file(&self.data_dir, project_id)?;
        match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                AppError::Persistence(format!("malformed {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProjectLink::default()),
            Err(e) => Err(AppError::Persistence(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Point the project at `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the file cannot be written.
    pub fn set_active(&self, project_id: &str, session_id: &str) -> Result<()> {
        let _guard = self.lock();
        let mut link = self.load(project_id)?;
        link.active_session_id = Some(session_id.to_owned());
        self.store(project_id, &link)
    }

    /// Clear the back-reference if it still points at `session_id`.
    ///
    /// Returns whether a reference was cleared. A reference to a different
    /// session is left alone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the file cannot be read or written.
    pub fn clear_active(&self, project_id: &str, session_id: &str) -> Result<bool> {
        let _guard = self.lock();
        let mut link = self.load(project_id)?;
        if link.active_session_id.as_deref() != Some(session_id) {
            return Ok(false);
        }
        link.active_session_id = None;
        self.store(project_id, &link)?;
        Ok(true)
    }

    fn store(&self, project_id: &str, link: &ProjectLink) -> Result<()> {
        let path = project_file(&self.data_dir, project_id)?;
        write_json(&path, link)
    }
}

fn write_json(path: &Path, link: &ProjectLink) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            AppError::Persistence(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let body = serde_json::to_vec_pretty(link)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)
        .map_err(|e| AppError::Persistence(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| AppError::Persistence(format!("failed to replace {}: {e}", path.display())))
}
