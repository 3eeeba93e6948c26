//! Registry admission rules and completion-driven removal.
//!
//! Runners here are never started, so no process is spawned; stopping an
//! unstarted runner ends it immediately as `stopped`.

use std::path::Path;

use agent_session_runner::config::AgentConfig;
use agent_session_runner::models::session::{
    RunnerPhase, SessionMetadata, SessionStatus, StrategyKind,
};
use agent_session_runner::orchestrator::session_manager::SessionManager;
use agent_session_runner::persistence::metadata::read_metadata;
use agent_session_runner::persistence::paths::SessionPaths;
use agent_session_runner::runner::strategy::strategy_for;
use agent_session_runner::runner::{RunnerSettings, SessionRunner};
use agent_session_runner::AppError;

fn runner(data_dir: &Path, project: &str, session: &str) -> SessionRunner {
    let meta = SessionMetadata::new(session.into(), project.into(), "hi".into(), StrategyKind::Streaming);
    let paths = SessionPaths::new(data_dir, project, session).expect("paths");
    SessionRunner::new(
        meta,
        paths,
        strategy_for(StrategyKind::Streaming, &AgentConfig::default()),
        RunnerSettings::default(),
    )
}

fn admit(
    manager: &SessionManager,
    data_dir: &Path,
    project: &str,
    session: &str,
) -> agent_session_runner::Result<SessionRunner> {
    let r = runner(data_dir, project, session);
    manager.try_start_session(session, project, r.clone()).map(|()| r)
}

#[test]
fn admits_until_ceiling_then_rejects() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(3);

    for n in 0..3 {
        admit(&manager, temp.path(), &format!("p{n}"), &format!("s{n}")).expect("admit");
    }
    assert_eq!(manager.running_count(), 3);

    let err = admit(&manager, temp.path(), "p9", "s9").unwrap_err();
    assert!(matches!(err, AppError::CapacityExceeded(_)));
    assert_eq!(manager.running_count(), 3);
    assert!(manager.get("s9").is_none());
    assert!(manager.session_for_project("p9").is_none());
}

#[test]
fn one_session_per_project() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(3);
    admit(&manager, temp.path(), "p1", "s1").expect("admit");

    let err = admit(&manager, temp.path(), "p1", "s2").unwrap_err();
    assert!(matches!(err, AppError::AlreadyRunning(msg) if msg.contains("s1")));
    assert_eq!(manager.session_for_project("p1").as_deref(), Some("s1"));
    assert_eq!(manager.running_count(), 1);
}

#[test]
fn rejected_admission_leaves_no_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(1);
    admit(&manager, temp.path(), "p1", "s1").expect("admit");

    admit(&manager, temp.path(), "p2", "s2").unwrap_err();

    assert!(!temp.path().join("p2").exists());
}

#[test]
fn completion_removes_both_entries() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(3);
    let runner = admit(&manager, temp.path(), "p1", "s1").expect("admit");

    assert!(manager.stop_session("s1"));

    assert_eq!(runner.phase(), RunnerPhase::Ended);
    assert_eq!(manager.running_count(), 0);
    assert!(manager.session_for_project("p1").is_none());
    let outcome = runner.outcome().expect("ended");
    assert_eq!(outcome.status, SessionStatus::Stopped);

    let meta = read_metadata(&SessionPaths::new(temp.path(), "p1", "s1").expect("paths").metadata())
        .expect("meta");
    assert_eq!(meta.status, SessionStatus::Stopped);

    // The project is free again.
    admit(&manager, temp.path(), "p1", "s2").expect("readmit");
}

#[test]
fn stop_unknown_session_returns_false() {
    let manager = SessionManager::new(3);
    assert!(!manager.stop_session("nope"));
}

#[test]
fn stop_is_idempotent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(3);
    let runner = admit(&manager, temp.path(), "p1", "s1").expect("admit");

    runner.stop();
    runner.stop();

    assert_eq!(runner.outcome().expect("ended").status, SessionStatus::Stopped);
    assert!(!manager.stop_session("s1"));
}

#[tokio::test]
async fn stop_all_waits_for_every_runner() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = SessionManager::new(3);
    let runners: Vec<SessionRunner> = (0..3)
        .map(|n| admit(&manager, temp.path(), &format!("p{n}"), &format!("s{n}")).expect("admit"))
        .collect();

    manager.stop_all().await;

    assert_eq!(manager.running_count(), 0);
    for runner in runners {
        assert_eq!(runner.wait().await.status, SessionStatus::Stopped);
    }
}

#[tokio::test]
async fn send_message_to_unstarted_runner_is_not_idle() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = runner(temp.path(), "p1", "s1");
    let err = runner.send_message("hello").await.unwrap_err();
    assert!(matches!(err, AppError::NotIdle(_)));
}

#[test]
fn listener_registered_after_end_runs_immediately() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = runner(temp.path(), "p1", "s1");
    runner.stop();

    let (tx, rx) = std::sync::mpsc::channel();
    runner.on_complete(move |done| {
        tx.send(done.status).expect("send");
    });
    assert_eq!(rx.try_recv().expect("called"), SessionStatus::Stopped);
}

#[test]
fn concurrent_admission_respects_both_limits() {
    let temp = tempfile::tempdir().expect("tempdir");

    for _ in 0..20 {
        let manager = SessionManager::new(3);
        let barrier = std::sync::Barrier::new(16);
        let admitted: Vec<(String, String)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|n| {
                    let (manager, barrier) = (&manager, &barrier);
                    // Half race for one project, half for their own.
                    let project = if n % 2 == 0 {
                        "shared".to_owned()
                    } else {
                        format!("own{n}")
                    };
                    let session = format!("s{n}");
                    let r = runner(temp.path(), &project, &session);
                    scope.spawn(move || {
                        barrier.wait();
                        match manager.try_start_session(&session, &project, r) {
                            Ok(()) => Some((project, session)),
                            Err(AppError::AlreadyRunning(_) | AppError::CapacityExceeded(_)) => None,
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().expect("join"))
                .collect()
        });

        assert_eq!(admitted.len(), 3, "ceiling is reached but never exceeded");
        assert_eq!(manager.running_count(), 3);
        let shared = admitted.iter().filter(|(p, _)| p == "shared").count();
        assert!(shared <= 1, "at most one session per project");
        for (project, session) in &admitted {
            assert_eq!(manager.session_for_project(project).as_deref(), Some(session.as_str()));
        }
    }
}
