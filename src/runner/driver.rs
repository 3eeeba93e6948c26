//! The per-session state machine.
//!
//! A [`Driver`] runs as one task per session and is the only code that
//! mutates the session's metadata. It serializes everything that can happen
//! to a session (caller commands, process output, process exit, timers) through
//! a single `select!` loop, so transitions never race each other.
//!
//! ```text
//!            start()                result / exit 0
//!   ──────► processing ───────────────────────────► idle
//!               ▲  │                                 │
//!               │  │ stop / timeout / cap / failure  │ send_message()
//!               │  ▼                                 │
//!               │ ended ◄──── stop / timeout ────────┤
//!               └────────────────────────────────────┘
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::parser::{parse_line, TurnResult};
use crate::agent::process::{AttachedProcess, ProcessExit, ProcessMessage, ProcessSignal};
use crate::models::event::{DoneInfo, EventDraft, EventKind, SessionEvent};
use crate::models::session::{RunnerPhase, SessionMetadata, SessionStatus};
use crate::persistence::event_log::EventLogWriter;
use crate::persistence::metadata::write_metadata;
use crate::persistence::paths::SessionPaths;
use crate::runner::hub::EventHub;
use crate::runner::strategy::{ExitDisposition, Launch, TurnBoundary, TurnStrategy};
use crate::runner::RunnerSettings;
use crate::{AppError, Result};

/// Bytes of stderr kept for failure diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

/// Longest raw line copied into an `unparsed` system event.
const RAW_LINE_PREVIEW: usize = 2000;

/// Requests from the runner handle to its driver.
#[derive(Debug)]
pub(crate) enum RunnerCommand {
    /// Deliver a follow-up turn.
    Send {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

type Listener = Box<dyn FnOnce(&DoneInfo) + Send>;

#[derive(Default)]
struct CompletionState {
    outcome: Option<DoneInfo>,
    listeners: Vec<Listener>,
}

/// Completion fan-out: synchronous listeners first, then the watch channel.
pub(crate) struct Completion {
    state: Mutex<CompletionState>,
    done_tx: watch::Sender<Option<DoneInfo>>,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("done", &*self.done_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl Completion {
    pub(crate) fn new() -> Self {
        let (done_tx, _) = watch::channel(None);
        Self {
            state: Mutex::new(CompletionState::default()),
            done_tx,
        }
    }

    /// Register a listener; runs immediately if the session already ended.
    pub(crate) fn listen(&self, listener: Listener) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outcome) = state.outcome.clone() {
            drop(state);
            listener(&outcome);
            return;
        }
        state.listeners.push(listener);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<DoneInfo>> {
        self.done_tx.subscribe()
    }

    fn complete(&self, done: &DoneInfo) {
        let listeners = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(done.clone());
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            listener(done);
        }
        self.done_tx.send_replace(Some(done.clone()));
    }
}

/// Terminal status waiting for the attached process to exit.
#[derive(Debug, Clone)]
struct Termination {
    status: SessionStatus,
    error: Option<String>,
}

/// Owns one session's process(es), metadata, and event log.
#[derive(Debug)]
pub(crate) struct Driver {
    meta: SessionMetadata,
    paths: SessionPaths,
    log: EventLogWriter,
    strategy: Box<dyn TurnStrategy>,
    settings: RunnerSettings,
    hub: Arc<EventHub>,
    phase_tx: watch::Sender<RunnerPhase>,
    completion: Arc<Completion>,
    commands: mpsc::Receiver<RunnerCommand>,
    stop: CancellationToken,
    proc_tx: mpsc::UnboundedSender<ProcessMessage>,
    proc_rx: mpsc::UnboundedReceiver<ProcessMessage>,
    process: Option<AttachedProcess>,
    generation: u64,
    next_event_id: u64,
    capped: bool,
    kill_issued: bool,
    terminating: Option<Termination>,
    session_deadline: Option<Instant>,
    turn_deadline: Option<Instant>,
    kill_deadline: Option<Instant>,
    stderr_tail: String,
    ended: bool,
}

/// Everything a driver needs besides its own bookkeeping.
pub(crate) struct DriverParts {
    pub(crate) meta: SessionMetadata,
    pub(crate) paths: SessionPaths,
    pub(crate) strategy: Box<dyn TurnStrategy>,
    pub(crate) settings: RunnerSettings,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) phase_tx: watch::Sender<RunnerPhase>,
    pub(crate) completion: Arc<Completion>,
    pub(crate) commands: mpsc::Receiver<RunnerCommand>,
    pub(crate) stop: CancellationToken,
}

impl Driver {
    pub(crate) fn new(parts: DriverParts) -> Self {
        let (proc_tx, proc_rx) = mpsc::unbounded_channel();
        let log = EventLogWriter::new(parts.paths.events());
        Self {
            meta: parts.meta,
            paths: parts.paths,
            log,
            strategy: parts.strategy,
            settings: parts.settings,
            hub: parts.hub,
            phase_tx: parts.phase_tx,
            completion: parts.completion,
            commands: parts.commands,
            stop: parts.stop,
            proc_tx,
            proc_rx,
            process: None,
            generation: 0,
            next_event_id: 0,
            capped: false,
            kill_issued: false,
            terminating: None,
            session_deadline: None,
            turn_deadline: None,
            kill_deadline: None,
            stderr_tail: String::new(),
            ended: false,
        }
    }

    /// End a runner that was never started.
    pub(crate) fn abandon(mut self) {
        info!(session_id = %self.meta.id, "session stopped before it started");
        self.finalize(SessionStatus::Stopped, None);
    }

    /// Drive the session until it ends.
    pub(crate) async fn run(mut self) {
        let span = info_span!(
            "session_runner",
            session_id = %self.meta.id,
            project_id = %self.meta.project_id,
            strategy = ?self.strategy.kind(),
        );
        async move {
            self.begin_session();
            while !self.ended {
                self.step().await;
            }
            debug!("driver loop finished");
        }
        .instrument(span)
        .await;
    }

    async fn step(&mut self) {
        let accepting_stop = self.terminating.is_none();
        tokio::select! {
            () = self.stop.cancelled(), if accepting_stop => {
                self.terminate(SessionStatus::Stopped, None);
            }
            () = sleep_until_opt(self.session_deadline), if accepting_stop => {
                let limit = self.settings.session_timeout.as_secs();
                self.terminate(
                    SessionStatus::TimedOut,
                    Some(format!("session exceeded its {limit}s limit")),
                );
            }
            () = sleep_until_opt(self.turn_deadline), if accepting_stop => {
                let limit = self.settings.turn_timeout.as_secs();
                self.terminate(
                    SessionStatus::TimedOut,
                    Some(format!("turn exceeded its {limit}s limit")),
                );
            }
            () = sleep_until_opt(self.kill_deadline) => self.force_kill(),
            Some(command) = self.commands.recv() => self.handle_command(command),
            Some(message) = self.proc_rx.recv() => self.handle_process(message),
        }
    }

    // ── Turn lifecycle ──────────────────────────────────────────────────────

    fn begin_session(&mut self) {
        let now = Instant::now();
        self.meta.started_at = Utc::now();
        self.meta.turn_count = 1;
        self.session_deadline = Some(now + self.settings.session_timeout);
        self.turn_deadline = Some(now + self.settings.turn_timeout);
        self.set_phase(RunnerPhase::Processing);
        info!(turn = 1, "session started");

        self.generation += 1;
        let launch = Launch {
            session_id: &self.meta.id,
            generation: self.generation,
            events: &self.proc_tx,
        };
        let spawned = self.strategy.spawn_turn(
            &launch,
            &self.meta.prompt,
            self.meta.continuation_token.as_deref(),
        );
        match spawned {
            Ok(process) => self.attach(process),
            Err(err) => self.fail_turn_start(&err),
        }
    }

    fn handle_command(&mut self, command: RunnerCommand) {
        match command {
            RunnerCommand::Send { text, reply } => {
                let outcome = self.send_message(&text);
                let _ = reply.send(outcome);
            }
        }
    }

    fn send_message(&mut self, text: &str) -> Result<()> {
        if self.terminating.is_some() || *self.phase_tx.borrow() != RunnerPhase::Idle {
            return Err(AppError::NotIdle(format!(
                "session {} is not waiting for input",
                self.meta.id
            )));
        }

        self.meta.turn_count += 1;
        self.turn_deadline = Some(Instant::now() + self.settings.turn_timeout);
        self.set_phase(RunnerPhase::Processing);
        info!(turn = self.meta.turn_count, "follow-up turn started");

        self.generation += 1;
        let launch = Launch {
            session_id: &self.meta.id,
            generation: self.generation,
            events: &self.proc_tx,
        };
        let delivered = self.strategy.deliver_message(
            &launch,
            self.process.as_ref(),
            text,
            self.meta.continuation_token.as_deref(),
        );
        match delivered {
            Ok(Some(process)) => self.attach(process),
            Ok(None) => self.persist(),
            Err(err) => self.fail_turn_start(&err),
        }
        Ok(())
    }

    fn attach(&mut self, process: AttachedProcess) {
        self.meta.pid = process.pid();
        self.stderr_tail.clear();
        self.kill_issued = false;
        self.process = Some(process);
        self.persist();
    }

    /// A turn could not be launched or delivered. Spawn failures and protocol
    /// violations both end the session as `failed`.
    fn fail_turn_start(&mut self, err: &AppError) {
        let source = if matches!(err, AppError::Spawn(_)) {
            "spawn"
        } else {
            "protocol"
        };
        warn!(error = %err, source, "failed to start agent turn");
        self.emit(EventDraft::new(
            EventKind::Error,
            json!({ "message": err.to_string(), "source": source }),
        ));
        self.terminate(SessionStatus::Failed, Some(err.to_string()));
    }

    fn settle_turn(&mut self) {
        self.turn_deadline = None;
        self.set_phase(RunnerPhase::Idle);
        info!(turn = self.meta.turn_count, "turn complete");
    }

    // ── Process output ──────────────────────────────────────────────────────

    fn handle_process(&mut self, message: ProcessMessage) {
        let current = self.process.as_ref().map(AttachedProcess::generation);
        if current != Some(message.generation) {
            debug!(generation = message.generation, "ignoring output from a finished process");
            return;
        }
        match message.signal {
            ProcessSignal::Stdout(line) => self.handle_line(&line),
            ProcessSignal::Stderr(line) => self.capture_stderr(&line),
            ProcessSignal::Exited(exit) => self.handle_exit(&exit),
        }
    }

    fn handle_line(&mut self, line: &str) {
        match parse_line(line) {
            Ok(parsed) => {
                if let Some(token) = parsed.continuation_token {
                    if self.meta.continuation_token.as_deref() != Some(token.as_str()) {
                        debug!(token = %token, "continuation token updated");
                        self.meta.continuation_token = Some(token);
                    }
                }
                for draft in parsed.events {
                    self.emit(draft);
                }
                if let Some(result) = parsed.turn_result {
                    self.handle_turn_result(&result);
                }
            }
            Err(err) => {
                warn!(error = %err, "unparseable agent output line");
                let raw: String = line.chars().take(RAW_LINE_PREVIEW).collect();
                self.emit(EventDraft::new(
                    EventKind::System,
                    json!({ "subtype": "unparsed", "raw": raw, "error": err.to_string() }),
                ));
            }
        }
    }

    fn handle_turn_result(&mut self, result: &TurnResult) {
        if self.terminating.is_some() {
            return;
        }
        if result.is_error {
            self.meta.error = Some(
                result
                    .text
                    .clone()
                    .unwrap_or_else(|| "agent reported an error".into()),
            );
        }
        match self.strategy.on_turn_result() {
            TurnBoundary::EndTurn => self.settle_turn(),
            TurnBoundary::AwaitExit => self.persist(),
        }
    }

    fn capture_stderr(&mut self, line: &str) {
        debug!(stderr = %line, "agent stderr");
        self.stderr_tail.push_str(line);
        self.stderr_tail.push('\n');
        if self.stderr_tail.len() > STDERR_TAIL_BYTES {
            let mut cut = self.stderr_tail.len() - STDERR_TAIL_BYTES;
            while !self.stderr_tail.is_char_boundary(cut) {
                cut += 1;
            }
            self.stderr_tail.drain(..cut);
        }
    }

    fn with_stderr(&self, message: String) -> String {
        let tail = self.stderr_tail.trim();
        if tail.is_empty() {
            message
        } else {
            format!("{message}; stderr: {tail}")
        }
    }

    fn handle_exit(&mut self, exit: &ProcessExit) {
        self.process = None;
        self.meta.pid = None;
        self.meta.exit_code = exit.code;
        self.kill_deadline = None;

        if let Some(termination) = self.terminating.take() {
            self.finalize(termination.status, termination.error);
            return;
        }

        match self.strategy.on_process_exit(exit, self.kill_issued) {
            ExitDisposition::TurnEnded => self.settle_turn(),
            ExitDisposition::TurnFailed(message) => {
                let message = self.with_stderr(message);
                warn!(error = %message, "agent turn failed");
                self.emit(EventDraft::new(
                    EventKind::Error,
                    json!({ "message": message, "exit_code": exit.code, "source": "turn" }),
                ));
                self.meta.error = Some(message);
                self.settle_turn();
            }
            ExitDisposition::SessionEnded { status, error } => {
                let error = error.map(|e| self.with_stderr(e));
                if let Some(message) = &error {
                    warn!(error = %message, "agent process ended the session");
                    self.emit(EventDraft::new(
                        EventKind::Error,
                        json!({ "message": message, "exit_code": exit.code, "source": "exit" }),
                    ));
                }
                self.finalize(status, error);
            }
        }
    }

    // ── Termination ─────────────────────────────────────────────────────────

    /// Begin the shared stop path: close stdin and SIGTERM now, SIGKILL after
    /// the grace window. The first reason recorded wins.
    fn terminate(&mut self, status: SessionStatus, error: Option<String>) {
        if self.ended || self.terminating.is_some() {
            return;
        }
        info!(?status, reason = error.as_deref().unwrap_or("requested"), "terminating session");
        self.turn_deadline = None;
        self.session_deadline = None;

        match self.process.as_mut() {
            Some(process) => {
                process.request_shutdown();
                self.kill_issued = true;
                self.kill_deadline = Some(Instant::now() + self.settings.kill_grace);
                self.terminating = Some(Termination { status, error });
            }
            None => self.finalize(status, error),
        }
    }

    fn force_kill(&mut self) {
        self.kill_deadline = None;
        if let Some(process) = &self.process {
            warn!(
                pid = process.pid(),
                grace_ms = u64::try_from(self.settings.kill_grace.as_millis()).unwrap_or(u64::MAX),
                "agent ignored graceful shutdown, force-killing"
            );
            process.force_kill();
        }
    }

    fn finalize(&mut self, status: SessionStatus, error: Option<String>) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.turn_deadline = None;
        self.session_deadline = None;
        self.kill_deadline = None;
        self.meta.finish(status, error, Utc::now());
        self.phase_tx.send_replace(RunnerPhase::Ended);
        self.persist();

        let done = DoneInfo {
            status,
            duration_ms: self.meta.duration_ms,
            error: self.meta.error.clone(),
        };
        info!(
            ?status,
            duration_ms = self.meta.duration_ms,
            events = self.meta.event_count,
            turns = self.meta.turn_count,
            "session ended"
        );
        // Registry and project links are released before any viewer sees `done`.
        self.completion.complete(&done);
        self.hub.finish(done);
    }

    // ── Events & persistence ────────────────────────────────────────────────

    /// Stamp, log, and publish one event, enforcing the event cap.
    fn emit(&mut self, draft: EventDraft) {
        if self.capped {
            return;
        }
        if self.next_event_id >= self.settings.max_events {
            self.capped = true;
            let message = format!(
                "event limit of {} reached; terminating session",
                self.settings.max_events
            );
            warn!(limit = self.settings.max_events, "event limit reached");
            self.append(EventDraft::new(
                EventKind::Error,
                json!({ "message": message, "source": "event_limit" }),
            ));
            self.terminate(SessionStatus::Failed, Some(message));
            return;
        }
        self.append(draft);
    }

    fn append(&mut self, draft: EventDraft) {
        let event = SessionEvent::new(self.next_event_id, draft.kind, draft.data);
        self.next_event_id += 1;
        if let Err(err) = self.log.append(&event) {
            warn!(event_id = event.id, error = %err, "failed to append event to log");
        }
        self.hub.publish(event);
    }

    fn set_phase(&mut self, phase: RunnerPhase) {
        self.meta.mode = phase;
        if phase != RunnerPhase::Processing {
            self.meta.pid = self.process.as_ref().and_then(AttachedProcess::pid);
        }
        self.persist();
        self.phase_tx.send_replace(phase);
    }

    fn persist(&mut self) {
        self.meta.event_count = self.next_event_id;
        if let Err(err) = write_metadata(&self.paths.metadata(), &self.meta) {
            warn!(error = %err, "failed to write session metadata");
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
