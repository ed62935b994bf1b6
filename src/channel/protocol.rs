//! Wire protocol of the performance backend's step stream.

use serde::Serialize;
use serde_json::Value;

use super::state::StreamPhase;
use crate::error::{LiveError, Result};
use crate::step::Step;

/// Audience name used when none is given.
pub const DEFAULT_VIEWER: &str = "viewer";

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ClientMessage {
    Danmaku { text: String, user: String },
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ServerMessage {
    Step(Step),
    Info(String),
    ScriptReady {
        total_steps: u32,
        script_preview: Vec<String>,
        content: String,
    },
    UserCount(u32),
    Danmaku {
        text: String,
        user: String,
    },
    Success(String),
    Error(String),
    System,
}

/// Parse one text frame.
///
/// The `step` body goes through [`Step::from_json`] so that every accepted
/// backend shape is normalized in one place.
pub(crate) fn parse_server_message(text: &str) -> Result<ServerMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| LiveError::Protocol(format!("not JSON: {e}")))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| LiveError::Protocol("missing message type".into()))?;

    let content = || string_field(&value, "content");

    let msg = match kind {
        "step" => ServerMessage::Step(Step::from_json(&value)?),
        "info" => ServerMessage::Info(content()),
        "script_ready" => ServerMessage::ScriptReady {
            total_steps: u32_field(&value, "total_steps"),
            script_preview: value
                .get("script_preview")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            content: content(),
        },
        "user_count" => ServerMessage::UserCount(u32_field(&value, "count")),
        "danmaku" => {
            let user = string_field(&value, "user");
            ServerMessage::Danmaku {
                text: string_field(&value, "text"),
                user: if user.is_empty() {
                    DEFAULT_VIEWER.to_owned()
                } else {
                    user
                },
            }
        }
        "success" => ServerMessage::Success(content()),
        "error" => {
            let message = content();
            ServerMessage::Error(if message.is_empty() {
                "unknown error".to_owned()
            } else {
                message
            })
        }
        "system" => ServerMessage::System,
        other => {
            return Err(LiveError::Protocol(format!("unknown message type '{other}'")));
        }
    };
    Ok(msg)
}

/// Phase implied by an `info` message, if any.
///
/// The backend announces progress in free text; both its native wording and
/// English equivalents are recognized.
pub(crate) fn phase_hint(content: &str) -> Option<StreamPhase> {
    let lower = content.to_lowercase();
    if content.contains("初始化") || lower.contains("initializ") {
        Some(StreamPhase::Initializing)
    } else if content.contains("剧本") || lower.contains("script") {
        Some(StreamPhase::GeneratingScript)
    } else if content.contains("表演") || lower.contains("perform") {
        Some(StreamPhase::Performing)
    } else {
        None
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

fn u32_field(value: &Value, key: &str) -> u32 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
