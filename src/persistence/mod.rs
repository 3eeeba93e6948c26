//! Flat-file persistence for session metadata, event logs, and project links.
//!
//! Layout under the configured data directory:
//!
//! ```text
//! <data_dir>/<project_id>/project.json
//! <data_dir>/<project_id>/sessions/<session_id>/meta.json
//! <data_dir>/<project_id>/sessions/<session_id>/events.jsonl
//! ```

pub mod event_log;
pub mod metadata;
pub mod paths;
pub mod project_index;
