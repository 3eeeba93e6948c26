//! Whole-file reads and writes of `meta.json`.

use std::fs;
use std::path::Path;

use crate::models::session::SessionMetadata;
use crate::{AppError, Result};

/// Write `meta` to `path`, replacing any previous contents.
///
/// The record is written to a sibling temp file and renamed into place so a
/// reader never observes a half-written document.
///
/// # Errors
///
/// Returns `AppError::Persistence` if the directory cannot be created or the
/// file cannot be written.
pub fn write_metadata(path: &Path, meta: &SessionMetadata) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            AppError::Persistence(format!(
                "failed to create session directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    let body = serde_json::to_vec_pretty(meta)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).map_err(|e| {
        AppError::Persistence(format!("failed to write {}: {e}", tmp.display()))
    })?;
    fs::rename(&tmp, path).map_err(|e| {
        AppError::Persistence(format!("failed to replace {}: {e}", path.display()))
    })?;
    Ok(())
}

/// Read `meta.json`.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the file does not exist, or
/// `AppError::Persistence` if it cannot be read or parsed.
pub fn read_metadata(path: &Path) -> Result<SessionMetadata> {
    let raw = fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("no metadata at {}", path.display()))
        } else {
            AppError::Persistence(format!("failed to read {}: {e}", path.display()))
        }
    })?;
    serde_json::from_slice(&raw).map_err(|e| {
        AppError::Persistence(format!("malformed metadata {}: {e}", path.display()))
    })
}
