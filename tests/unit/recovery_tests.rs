//! Startup recovery sweep over persisted session metadata.

use chrono::{Duration, Utc};

use agent_session_runner::models::event::{EventKind, SessionEvent};
use agent_session_runner::models::session::{
    RunnerPhase, SessionMetadata, SessionStatus, StrategyKind,
};
use agent_session_runner::orchestrator::recovery::{
    recover_sessions, IDLE_RESTART_ERROR, PROCESSING_RESTART_ERROR,
};
use agent_session_runner::persistence::event_log::EventLogWriter;
use agent_session_runner::persistence::metadata::{read_metadata, write_metadata};
use agent_session_runner::persistence::paths::SessionPaths;
use agent_session_runner::persistence::project_index::ProjectIndex;

fn persist(data_dir: &std::path::Path, project: &str, session: &str, mode: RunnerPhase) -> SessionPaths {
    let paths = SessionPaths::new(data_dir, project, session).expect("paths");
    let mut meta = SessionMetadata::new(session.into(), project.into(), "p".into(), StrategyKind::Streaming);
    meta.started_at = Utc::now() - Duration::seconds(90);
    meta.mode = mode;
    meta.pid = Some(31337);
    meta.event_count = 12;
    write_metadata(&paths.metadata(), &meta).expect("write");
    paths
}

#[test]
fn processing_session_becomes_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let index = ProjectIndex::new(temp.path().to_path_buf());
    let paths = persist(temp.path(), "p1", "s1", RunnerPhase::Processing);
    index.set_active("p1", "s1").expect("link");

    let report = recover_sessions(temp.path(), &index);

    assert_eq!(report.failed, vec!["s1".to_owned()]);
    assert!(report.stopped.is_empty());
    let meta = read_metadata(&paths.metadata()).expect("read");
    assert_eq!(meta.status, SessionStatus::Failed);
    assert_eq!(meta.error.as_deref(), Some(PROCESSING_RESTART_ERROR));
    assert_eq!(meta.mode, RunnerPhase::Ended);
    assert!(meta.pid.is_none());
    assert!(meta.ended_at.is_some());
    assert!(meta.duration_ms.expect("duration") >= 90_000);
    assert_eq!(meta.event_count, 12);
    assert!(index.load("p1").expect("load").active_session_id.is_none());
}

#[test]
fn idle_session_becomes_stopped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let index = ProjectIndex::new(temp.path().to_path_buf());
    let paths = persist(temp.path(), "p1", "s1", RunnerPhase::Idle);

    let report = recover_sessions(temp.path(), &index);

    assert_eq!(report.stopped, vec!["s1".to_owned()]);
    let meta = read_metadata(&paths.metadata()).expect("read");
    assert_eq!(meta.status, SessionStatus::Stopped);
    assert_eq!(meta.error.as_deref(), Some(IDLE_RESTART_ERROR));
}

#[test]
fn terminal_sessions_are_untouched() {
    let temp = tempfile::tempdir().expect("tempdir");
    let index = ProjectIndex::new(temp.path().to_path_buf());
    let paths = SessionPaths::new(temp.path(), "p1", "done").expect("paths");
    let mut meta = SessionMetadata::new("done".into(), "p1".into(), "p".into(), StrategyKind::Resume);
    meta.finish(SessionStatus::Completed, None, Utc::now());
    write_metadata(&paths.metadata(), &meta).expect("write");
    let before = std::fs::read(paths.metadata()).expect("read");

    let report = recover_sessions(temp.path(), &index);

    assert_eq!(report.scanned, 1);
    assert_eq!(report.recovered(), 0);
    assert_eq!(std::fs::read(paths.metadata()).expect("read"), before);
}

#[test]
fn sweep_covers_every_project_and_counts_unreadable_dirs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let index = ProjectIndex::new(temp.path().to_path_buf());
    persist(temp.path(), "p1", "a", RunnerPhase::Processing);
    persist(temp.path(), "p2", "b", RunnerPhase::Idle);
    std::fs::create_dir_all(temp.path().join("p3/sessions/empty")).expect("mkdir");

    let report = recover_sessions(temp.path(), &index);

    assert_eq!(report.scanned, 3);
    assert_eq!(report.recovered(), 2);
    assert_eq!(report.errors, 1);
}

#[test]
fn back_reference_to_other_session_survives() {
    let temp = tempfile::tempdir().expect("tempdir");
    let index = ProjectIndex::new(temp.path().to_path_buf());
    persist(temp.path(), "p1", "old", RunnerPhase::Processing);
    index.set_active("p1", "newer").expect("link");

    recover_sessions(temp.path(), &index);

    assert_eq!(
        index.load("p1").expect("load").active_session_id.as_deref(),
        Some("newer")
    );
}

#[test]
fn missing_data_dir_is_an_empty_sweep() {
    let temp = tempfile::tempdir().expect("tempdir");
    let index = ProjectIndex::new(temp.path().join("absent"));
    let report = recover_sessions(&temp.path().join("absent"), &index);
    assert_eq!(report.scanned, 0);
}

#[test]
fn event_count_catches_up_with_the_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let index = ProjectIndex::new(temp.path().to_path_buf());
    let paths = persist(temp.path(), "p1", "s1", RunnerPhase::Processing);
    let mut log = EventLogWriter::new(paths.events());
    for id in 0..17 {
        let data = serde_json::json!({ "text": format!("chunk {id}") });
        log.append(&SessionEvent::new(id, EventKind::AssistantText, data))
            .expect("append");
    }

    recover_sessions(temp.path(), &index);

    let meta = read_metadata(&paths.metadata()).expect("read");
    assert_eq!(meta.status, SessionStatus::Failed);
    assert_eq!(meta.event_count, 17);
}
