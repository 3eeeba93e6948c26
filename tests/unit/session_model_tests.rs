use chrono::{Duration, Utc};

use agent_session_runner::models::event::{EventKind, SessionEvent};
use agent_session_runner::models::session::{
    RunnerPhase, SessionMetadata, SessionStatus, StrategyKind,
};
use agent_session_runner::AppError;

#[test]
fn new_session_is_running_and_processing() {
    let meta = SessionMetadata::new("s".into(), "p".into(), "go".into(), StrategyKind::Streaming);
    assert_eq!(meta.status, SessionStatus::Running);
    assert_eq!(meta.mode, RunnerPhase::Processing);
    assert!(!meta.status.is_terminal());
    assert!(meta.ended_at.is_none());
}

#[test]
fn finish_stamps_terminal_fields_and_keeps_prior_error() {
    let mut meta = SessionMetadata::new("s".into(), "p".into(), "go".into(), StrategyKind::Resume);
    meta.started_at = Utc::now() - Duration::milliseconds(1500);
    meta.pid = Some(10);
    meta.error = Some("agent turn exited with code 1".into());

    meta.finish(SessionStatus::Stopped, None, Utc::now());

    assert!(meta.status.is_terminal());
    assert_eq!(meta.mode, RunnerPhase::Ended);
    assert!(meta.pid.is_none());
    assert!(meta.duration_ms.expect("duration") >= 1500);
    assert_eq!(meta.error.as_deref(), Some("agent turn exited with code 1"));
}

#[test]
fn timed_out_status_is_hyphenated_on_disk() {
    let json = serde_json::to_string(&SessionStatus::TimedOut).expect("json");
    assert_eq!(json, "\"timed-out\"");
    assert_eq!(
        serde_json::to_string(&SessionStatus::Stopped).expect("json"),
        "\"stopped\""
    );

    let parsed: SessionStatus = serde_json::from_str("\"timed-out\"").expect("parse");
    assert_eq!(parsed, SessionStatus::TimedOut);
    let legacy: SessionStatus = serde_json::from_str("\"timed_out\"").expect("parse");
    assert_eq!(legacy, SessionStatus::TimedOut);
}

#[test]
fn strategy_parses_from_cli_names() {
    assert_eq!("resume".parse::<StrategyKind>().expect("parse"), StrategyKind::Resume);
    assert_eq!("streaming".parse::<StrategyKind>().expect("parse"), StrategyKind::Streaming);
    assert!(matches!("batch".parse::<StrategyKind>(), Err(AppError::Config(_))));
}

#[test]
fn event_line_uses_type_key() {
    let event = SessionEvent::new(7, EventKind::ToolUse, serde_json::json!({ "name": "Bash" }));
    let value = serde_json::to_value(&event).expect("json");
    assert_eq!(value["id"], 7);
    assert_eq!(value["type"], "tool_use");
    assert_eq!(value["data"]["name"], "Bash");
}
