//! Session events and stream items delivered to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::SessionStatus;

/// Closed set of event types written to the log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Text produced by the agent.
    AssistantText,
    /// The agent invoked a tool.
    ToolUse,
    /// A tool returned output to the agent.
    ToolResult,
    /// Lifecycle or bookkeeping information.
    System,
    /// A failure surfaced to viewers.
    Error,
}

/// One permanently appended unit of observable progress.
///
/// `id` equals the event's 0-based position in the session log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEvent {
    /// Gapless sequence number.
    pub id: u64,
    /// When the event was stamped.
    pub timestamp: DateTime<Utc>,
    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Type-specific payload.
    pub data: Value,
}

impl SessionEvent {
    /// Stamp a new event with the current time.
    #[must_use]
    pub fn new(id: u64, kind: EventKind, data: Value) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            kind,
            data,
        }
    }
}

/// An event not yet assigned a sequence id.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    /// Event type tag.
    pub kind: EventKind,
    /// Type-specific payload.
    pub data: Value,
}

impl EventDraft {
    /// Build a draft.
    #[must_use]
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self { kind, data }
    }
}

/// Terminal signal carried to subscribers once a session has ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DoneInfo {
    /// Final status.
    pub status: SessionStatus,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Final error message, if any.
    pub error: Option<String>,
}

/// One item yielded by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A logged event (replayed or live).
    Event(SessionEvent),
    /// Periodic no-op keeping intermediaries from closing an idle connection.
    Keepalive,
    /// The session reached a terminal status; no further items follow.
    Done(DoneInfo),
}
