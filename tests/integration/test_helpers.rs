//! Shared helpers for runner integration tests.
//!
//! Fake agents are `sh -c` scripts speaking the stream-json protocol, so the
//! tests exercise real process spawning, stdio framing, and signals.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use agent_session_runner::config::RunnerConfig;
use agent_session_runner::models::event::{EventKind, SessionEvent, StreamItem};
use agent_session_runner::models::session::{SessionMetadata, StrategyKind};
use agent_session_runner::persistence::event_log::read_events;
use agent_session_runner::persistence::metadata::read_metadata;
use agent_session_runner::persistence::paths::SessionPaths;
use agent_session_runner::runner::hub::Subscription;
use agent_session_runner::runner::strategy::{ResumeStrategy, StreamingStrategy, TurnStrategy};
use agent_session_runner::runner::{RunnerSettings, SessionRunner};

pub const PROJECT: &str = "proj";

/// Streaming agent: init line, then one text + result pair per stdin line.
pub const ECHO_AGENT: &str = r#"
printf '%s\n' '{"type":"system","subtype":"init","session_id":"agent-tok","model":"fake"}'
n=0
while IFS= read -r line; do
  n=$((n+1))
  printf '{"type":"assistant","message":{"content":[{"type":"text","text":"turn %s"}]}}\n' "$n"
  printf '{"type":"result","subtype":"success","is_error":false,"result":"ok %s","session_id":"agent-tok"}\n' "$n"
done
"#;

/// Streaming agent that announces itself and then never finishes the turn.
pub const STUCK_AGENT: &str = r#"
printf '%s\n' '{"type":"system","subtype":"init","session_id":"stuck"}'
exec sleep 30
"#;

/// Like [`STUCK_AGENT`] but ignores SIGTERM.
pub const STUBBORN_AGENT: &str = r#"
trap '' TERM
printf '%s\n' '{"type":"system","subtype":"init","session_id":"stubborn"}'
exec sleep 30
"#;

/// Timers short enough for tests, with keepalives effectively off.
pub fn fast_settings() -> RunnerSettings {
    RunnerSettings {
        session_timeout: Duration::from_secs(60),
        turn_timeout: Duration::from_secs(20),
        kill_grace: Duration::from_millis(500),
        keepalive: Duration::from_secs(3600),
        max_events: 5000,
    }
}

pub fn sh_args(script: &str) -> Vec<String> {
    vec!["-c".into(), script.into(), "sh".into()]
}

pub fn streaming(script: &str) -> Box<dyn TurnStrategy> {
    Box::new(StreamingStrategy::new("sh", sh_args(script), None))
}

pub fn resume(script: &str) -> Box<dyn TurnStrategy> {
    Box::new(ResumeStrategy::new("sh", sh_args(script), "--resume", None))
}

/// Build and start a runner for `session` under `data_dir`.
pub fn start_runner(
    data_dir: &Path,
    session: &str,
    strategy: Box<dyn TurnStrategy>,
    settings: RunnerSettings,
) -> SessionRunner {
    let meta = SessionMetadata::new(
        session.into(),
        PROJECT.into(),
        "first prompt".into(),
        strategy.kind(),
    );
    let paths = SessionPaths::new(data_dir, PROJECT, session).expect("paths");
    let runner = SessionRunner::new(meta, paths, strategy, settings);
    runner.start();
    runner
}

/// Config whose agent is `sh -c <script>` for the given strategy.
pub fn sh_config(data_dir: &Path, script: &str, strategy: StrategyKind) -> RunnerConfig {
    let mut config = RunnerConfig {
        data_dir: data_dir.to_path_buf(),
        ..RunnerConfig::default()
    };
    config.agent.binary = "sh".into();
    config.agent.streaming_args = sh_args(script);
    config.agent.resume_args = sh_args(script);
    config.agent.default_strategy = strategy;
    config.timeouts.kill_grace_seconds = 1;
    config
}

/// Await `fut`, failing the test after ten seconds.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out waiting")
}

/// Next logged event from `sub`, skipping keepalives.
pub async fn next_event(sub: &mut Subscription) -> SessionEvent {
    loop {
        match within(sub.next()).await {
            Some(StreamItem::Event(event)) => return event,
            Some(StreamItem::Keepalive) => {}
            other => panic!("expected an event, got {other:?}"),
        }
    }
}

pub fn logged_events(data_dir: &Path, session: &str) -> Vec<SessionEvent> {
    let paths = SessionPaths::new(data_dir, PROJECT, session).expect("paths");
    read_events(&paths.events(), 0).expect("events")
}

pub fn logged_meta(data_dir: &Path, session: &str) -> SessionMetadata {
    let paths = SessionPaths::new(data_dir, PROJECT, session).expect("paths");
    read_metadata(&paths.metadata()).expect("metadata")
}

pub fn count_kind(events: &[SessionEvent], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

pub fn assert_contiguous(events: &[SessionEvent]) {
    for (index, event) in events.iter().enumerate() {
        assert_eq!(event.id, index as u64, "event ids must be gapless from 0");
    }
}
