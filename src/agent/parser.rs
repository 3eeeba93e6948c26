//! Agent stream-json output parser.
//!
//! Turns one line of the agent's stdout into zero or more [`EventDraft`]s,
//! plus the two signals the runner acts on: a continuation token and a turn
//! result.
//!
//! # Recognised line types
//!
//! | `type`      | Produces                                                      |
//! |-------------|---------------------------------------------------------------|
//! | `system`    | `system` event; `session_id` becomes the continuation token   |
//! | `assistant` | `assistant_text` per text block, `tool_use` per tool block    |
//! | `user`      | `tool_result` per tool-result block                           |
//! | `result`    | `system` event (+ `error` when `is_error`) and a turn result  |
//! | *(other)*   | Skipped; logged at `DEBUG`                                    |

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::models::event::{EventDraft, EventKind};
use crate::{AppError, Result};

/// Everything extracted from a single output line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLine {
    /// Events to stamp and append, in order.
    pub events: Vec<EventDraft>,
    /// Agent-side session id, when the line carried one.
    pub continuation_token: Option<String>,
    /// Present when the line was a `result` record.
    pub turn_result: Option<TurnResult>,
}

/// Summary of a finished agent turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    /// Whether the agent reported the turn as failed.
    pub is_error: bool,
    /// Final text of the turn.
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    message: Option<MessageBody>,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    content: Vec<Value>,
}

/// Parse one line of agent output.
///
/// Blank lines produce an empty [`ParsedLine`].
///
/// # Errors
///
/// Returns [`AppError::Parse`] when the line is not a JSON object with a
/// string `type` field.
pub fn parse_line(line: &str) -> Result<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(ParsedLine::default());
    }

    let envelope: Envelope = serde_json::from_str(trimmed)
        .map_err(|e| AppError::Parse(format!("malformed json: {e}")))?;

    let mut parsed = ParsedLine {
        continuation_token: envelope.session_id.clone().filter(|s| !s.is_empty()),
        ..ParsedLine::default()
    };

    match envelope.kind.as_str() {
        "system" => parsed.events.push(system_event(&envelope)),
        "assistant" => {
            if let Some(message) = &envelope.message {
                parsed.events.extend(message.content.iter().filter_map(assistant_block));
            }
        }
        "user" => {
            if let Some(message) = &envelope.message {
                parsed.events.extend(message.content.iter().filter_map(user_block));
            }
        }
        "result" => parse_result(&envelope, &mut parsed),
        other => {
            debug!(kind = other, "agent parser: skipping unknown line type");
        }
    }

    Ok(parsed)
}

fn system_event(envelope: &Envelope) -> EventDraft {
    let mut data = serde_json::Map::new();
    data.insert(
        "subtype".into(),
        envelope.subtype.clone().map_or(Value::Null, Value::String),
    );
    if let Some(session_id) = &envelope.session_id {
        data.insert("session_id".into(), Value::String(session_id.clone()));
    }
    for key in ["model", "cwd"] {
        if let Some(value) = envelope.rest.get(key) {
            data.insert(key.into(), value.clone());
        }
    }
    EventDraft::new(EventKind::System, Value::Object(data))
}

fn assistant_block(block: &Value) -> Option<EventDraft> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => {
            let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
            if text.is_empty() {
                return None;
            }
            Some(EventDraft::new(EventKind::AssistantText, json!({ "text": text })))
        }
        "tool_use" => Some(EventDraft::new(
            EventKind::ToolUse,
            json!({
                "id": block.get("id").cloned().unwrap_or(Value::Null),
                "name": block.get("name").and_then(Value::as_str).unwrap_or("unknown"),
                "input": block.get("input").cloned().unwrap_or(Value::Null),
            }),
        )),
        _ => None,
    }
}

fn user_block(block: &Value) -> Option<EventDraft> {
    if block.get("type").and_then(Value::as_str)? != "tool_result" {
        return None;
    }
    Some(EventDraft::new(
        EventKind::ToolResult,
        json!({
            "tool_use_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
            "content": flatten_content(block.get("content")),
            "is_error": block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        }),
    ))
}

/// Tool-result content arrives either as a string or as a list of text blocks.
fn flatten_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn parse_result(envelope: &Envelope, parsed: &mut ParsedLine) {
    let is_error = envelope
        .rest
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let text = envelope
        .rest
        .get("result")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    parsed.events.push(EventDraft::new(
        EventKind::System,
        json!({
            "subtype": "result",
            "result_subtype": envelope.subtype,
            "is_error": is_error,
            "result": text,
            "num_turns": envelope.rest.get("num_turns"),
            "duration_ms": envelope.rest.get("duration_ms"),
            "total_cost_usd": envelope.rest.get("total_cost_usd"),
        }),
    ));

    if is_error {
        parsed.events.push(EventDraft::new(
            EventKind::Error,
            json!({
                "message": text.clone().unwrap_or_else(|| "agent reported an error".into()),
                "source": "result",
            }),
        ));
    }

    parsed.turn_result = Some(TurnResult { is_error, text });
}

/// Serialize a follow-up user message for a stream-json stdin.
#[must_use]
pub fn user_message(text: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        },
    })
}
