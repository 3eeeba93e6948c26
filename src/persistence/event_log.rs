//! Append-only JSONL event log.
//!
//! One [`SessionEvent`] per line. The writer keeps the file handle open for
//! the life of the session; readers reopen the file and skip lines that fail
//! to parse (a torn final line after a crash, for example).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::models::event::SessionEvent;
use crate::{AppError, Result};

/// Appends events to a session's `events.jsonl`.
///
/// The file is opened lazily on the first append so that constructing a
/// writer has no on-disk effect.
#[derive(Debug)]
pub struct EventLogWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl EventLogWriter {
    /// Build a writer for `path`; nothing is opened until [`Self::append`].
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    fn open(&self) -> Result<BufWriter<File>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::Persistence(format!(
                    "failed to create log directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                AppError::Persistence(format!(
                    "failed to open event log {}: {e}",
                    self.path.display()
                ))
            })?;
        Ok(BufWriter::new(file))
    }

    /// Append one event and flush.
    ///
    /// On a write failure the handle is dropped so the next append reopens
    /// the file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the event cannot be serialized,
    /// or the file cannot be opened, written, or flushed.
    pub fn append(&mut self, event: &SessionEvent) -> Result<()> {
        if self.writer.is_none() {
            self.writer = Some(self.open()?);
        }
        let line = serde_json::to_string(event)?;
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let outcome = writeln!(writer, "{line}").and_then(|()| writer.flush());
        if let Err(e) = outcome {
            self.writer = None;
            return Err(AppError::Persistence(format!("event log write failed: {e}")));
        }
        Ok(())
    }
}

/// Read every event with `id >= offset` from `path`, in file order.
///
/// A missing file is an empty log.
///
/// # Errors
///
/// Returns `AppError::Persistence` if the file exists but cannot be read.
pub fn read_events(path: &Path, offset: u64) -> Result<Vec<SessionEvent>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(AppError::Persistence(format!(
                "failed to open event log {}: {e}",
                path.display()
            )))
        }
    };

    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| {
            AppError::Persistence(format!("failed to read {}: {e}", path.display()))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEvent>(&line) {
            Ok(event) if event.id >= offset => events.push(event),
            Ok(_) => {}
            Err(e) => {
                warn!(path = %path.display(), line = index + 1, error = %e, "skipping malformed event log line");
            }
        }
    }
    Ok(events)
}
