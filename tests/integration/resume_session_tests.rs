//! Resume strategy: one process per turn, chained by continuation token.

use agent_session_runner::models::event::EventKind;
use agent_session_runner::models::session::{RunnerPhase, SessionStatus};

use super::test_helpers::{
    assert_contiguous, fast_settings, logged_events, logged_meta, resume, start_runner, within,
};

/// Prints the token it was resumed with and the prompt, then hands out a
/// longer token. The prompt `fail` exits 3 with a stderr message.
const RESUME_AGENT: &str = r#"
tok=""
if [ "$1" = "--resume" ]; then tok="$2"; shift 2; fi
if [ "$1" = "fail" ]; then echo "boom" >&2; exit 3; fi
next="${tok}n"
printf '{"type":"system","subtype":"init","session_id":"%s"}\n' "$next"
printf '{"type":"assistant","message":{"content":[{"type":"text","text":"token=%s prompt=%s"}]}}\n' "${tok:-none}" "$1"
printf '{"type":"result","subtype":"success","is_error":false,"result":"ok","session_id":"%s"}\n' "$next"
"#;

fn texts(events: &[agent_session_runner::models::event::SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.kind == EventKind::AssistantText)
        .map(|e| e.data["text"].as_str().unwrap_or_default().to_owned())
        .collect()
}

#[tokio::test]
async fn later_turns_resume_with_previous_token() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = start_runner(temp.path(), "r1", resume(RESUME_AGENT), fast_settings());

    assert_eq!(within(runner.wait_settled()).await, RunnerPhase::Idle);
    let meta = logged_meta(temp.path(), "r1");
    assert_eq!(meta.continuation_token.as_deref(), Some("n"));
    assert!(meta.pid.is_none(), "no process is attached between resume turns");
    assert_eq!(meta.exit_code, Some(0));

    runner.send_message("second").await.expect("send");
    assert_eq!(within(runner.wait_settled()).await, RunnerPhase::Idle);

    runner.stop();
    let done = within(runner.wait()).await;
    assert_eq!(done.status, SessionStatus::Stopped);

    let events = logged_events(temp.path(), "r1");
    assert_contiguous(&events);
    assert_eq!(
        texts(&events),
        vec![
            "token=none prompt=first prompt".to_owned(),
            "token=n prompt=second".to_owned(),
        ]
    );
    assert_eq!(logged_meta(temp.path(), "r1").continuation_token.as_deref(), Some("nn"));
}

#[tokio::test]
async fn nonzero_exit_fails_the_turn_but_not_the_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = start_runner(temp.path(), "r1", resume(RESUME_AGENT), fast_settings());
    assert_eq!(within(runner.wait_settled()).await, RunnerPhase::Idle);

    runner.send_message("fail").await.expect("send");
    assert_eq!(within(runner.wait_settled()).await, RunnerPhase::Idle);

    let meta = logged_meta(temp.path(), "r1");
    assert_eq!(meta.status, SessionStatus::Running);
    assert_eq!(meta.exit_code, Some(3));
    let error = meta.error.expect("turn error recorded");
    assert!(error.contains("code 3"), "{error}");
    assert!(error.contains("boom"), "{error}");
    assert_eq!(meta.continuation_token.as_deref(), Some("n"));

    // The session still takes messages after a failed turn.
    runner.send_message("again").await.expect("send");
    assert_eq!(within(runner.wait_settled()).await, RunnerPhase::Idle);

    runner.stop();
    within(runner.wait()).await;

    let events = logged_events(temp.path(), "r1");
    assert_contiguous(&events);
    let errors: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data["exit_code"], 3);
    assert_eq!(texts(&events).last().map(String::as_str), Some("token=n prompt=again"));
    assert_eq!(logged_meta(temp.path(), "r1").turn_count, 3);
}

#[tokio::test]
async fn stop_between_turns_ends_immediately() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = start_runner(temp.path(), "r1", resume(RESUME_AGENT), fast_settings());
    assert_eq!(within(runner.wait_settled()).await, RunnerPhase::Idle);

    runner.stop();
    let done = within(runner.wait()).await;
    assert_eq!(done.status, SessionStatus::Stopped);
    assert!(done.duration_ms.is_some());
    assert_eq!(runner.phase(), RunnerPhase::Ended);
}
