//! Backend-A stream message grammar and parser.
//!
//! Backend-A is driven through a long-lived agent client that emits typed
//! messages: plain text deltas, complete assistant messages with content
//! blocks, system messages carrying the resume session id, and a terminal
//! result. Implements tolerant reader pattern: unknown fields ignored,
//! unknown types preserved for logging.

use serde_json::Value;

use super::ParsedStreamMessage;
use crate::error::{Error, Result};

/// Suffix of the namespaced MCP memorize tool.
const MEMORIZE_TOOL_SUFFIX: &str = "__memorize";

/// Canonical message types from the backend-A stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AlphaMessage {
    /// Incremental text delta.
    TextDelta { text: String },
    /// Complete assistant message with content blocks.
    Assistant { content: Vec<AlphaBlock> },
    /// System message; `init` carries the resume session id.
    System {
        subtype: String,
        session_id: Option<String>,
    },
    /// Terminal result for the turn.
    Result { is_error: bool, error: Option<String> },
    Unknown { msg_type: String, payload: Value },
}

/// Content block in a backend-A assistant message.
#[derive(Debug, Clone, PartialEq)]
pub enum AlphaBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { name: String, input: Value },
}

/// Parse a single stream line from the backend-A client.
pub fn parse_line(line: &str) -> Result<AlphaMessage> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical backend-A message.
pub fn parse_value(raw: &Value) -> Result<AlphaMessage> {
    let msg_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::EventParse("Missing 'type' field".into()))?;

    match msg_type {
        "text_delta" => Ok(AlphaMessage::TextDelta {
            text: raw
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        }),
        "assistant" => parse_assistant(raw),
        "system" => Ok(AlphaMessage::System {
            subtype: raw
                .get("subtype")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            session_id: raw
                .get("data")
                .and_then(|d| d.get("session_id"))
                .or_else(|| raw.get("session_id"))
                .and_then(|v| v.as_str())
                .map(String::from),
        }),
        "result" => Ok(AlphaMessage::Result {
            is_error: raw
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            error: raw.get("error").and_then(|v| v.as_str()).map(String::from),
        }),
        _ => Ok(AlphaMessage::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn parse_assistant(raw: &Value) -> Result<AlphaMessage> {
    let msg = raw.get("message").unwrap_or(raw);
    let content = parse_content_blocks(msg.get("content"));
    Ok(AlphaMessage::Assistant { content })
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<AlphaBlock> {
    let Some(arr) = content.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|block| {
            let block_type = block.get("type")?.as_str()?;
            match block_type {
                "text" => {
                    let text = block.get("text")?.as_str()?.to_string();
                    Some(AlphaBlock::Text { text })
                }
                "thinking" => {
                    let thinking = block
                        .get("thinking")
                        .or_else(|| block.get("text"))?
                        .as_str()?
                        .to_string();
                    Some(AlphaBlock::Thinking { thinking })
                }
                "tool_use" => {
                    let name = block.get("name")?.as_str()?.to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    Some(AlphaBlock::ToolUse { name, input })
                }
                _ => None,
            }
        })
        .collect()
}

/// Pure parser: one backend-A message in, the extended accumulation out.
///
/// Only `…__memorize` tool calls are surfaced here; skip and policy-check
/// are captured by post-tool-use hooks on the client and merged by the
/// agent manager.
pub fn parse_message(
    message: &AlphaMessage,
    current_response: &str,
    current_thinking: &str,
) -> ParsedStreamMessage {
    let mut parsed = ParsedStreamMessage {
        response_text: current_response.to_string(),
        thinking_text: current_thinking.to_string(),
        ..Default::default()
    };

    match message {
        AlphaMessage::TextDelta { text } => {
            parsed.response_text.push_str(text);
        }
        AlphaMessage::Assistant { content } => {
            for block in content {
                match block {
                    AlphaBlock::Text { text } => parsed.response_text.push_str(text),
                    AlphaBlock::Thinking { thinking } => parsed.thinking_text.push_str(thinking),
                    AlphaBlock::ToolUse { name, input } => {
                        if name.ends_with(MEMORIZE_TOOL_SUFFIX) {
                            if let Some(entry) =
                                input.get("memory_entry").and_then(|v| v.as_str())
                            {
                                if !entry.is_empty() {
                                    parsed.memory_entries.push(entry.to_string());
                                }
                            }
                        }
                    }
                }
            }
        }
        AlphaMessage::System { session_id, .. } => {
            parsed.session_id.clone_from(session_id);
        }
        AlphaMessage::Result { is_error, error } => {
            parsed.is_completed = true;
            if *is_error {
                parsed.error =
                    Some(error.clone().unwrap_or_else(|| "backend error".to_string()));
            }
        }
        AlphaMessage::Unknown { .. } => {}
    }

    parsed
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_delta_line() {
        let msg = parse_line(r#"{"type":"text_delta","text":"Hello"}"#).unwrap();
        assert_eq!(msg, AlphaMessage::TextDelta { text: "Hello".to_string() });
    }

    #[test]
    fn parse_system_session_id() {
        let msg =
            parse_line(r#"{"type":"system","subtype":"init","data":{"session_id":"s-42"}}"#)
                .unwrap();
        let AlphaMessage::System { session_id, .. } = msg else {
            panic!("expected system message");
        };
        assert_eq!(session_id.as_deref(), Some("s-42"));
    }

    #[test]
    fn tolerant_reader_keeps_unknown_types() {
        let msg = parse_line(r#"{"type":"future_type","data":123}"#).unwrap();
        assert!(matches!(msg, AlphaMessage::Unknown { .. }));
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(parse_line(r#"{"text":"no type"}"#).is_err());
    }

    #[test]
    fn parse_message_extends_response() {
        let msg = AlphaMessage::TextDelta { text: "lo".to_string() };
        let parsed = parse_message(&msg, "Hel", "");
        assert_eq!(parsed.response_text, "Hello");
        assert_eq!(parsed.thinking_text, "");
    }

    #[test]
    fn memorize_tool_surfaces_entry() {
        let msg = parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"mcp__social__memorize","input":{"memory_entry":"likes tea"}}]}}"#,
        )
        .unwrap();
        let parsed = parse_message(&msg, "", "");
        assert_eq!(parsed.memory_entries, vec!["likes tea".to_string()]);
    }

    #[test]
    fn thinking_block_goes_to_thinking_text() {
        let msg = parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"ok"}]}}"#,
        )
        .unwrap();
        let parsed = parse_message(&msg, "", "");
        assert_eq!(parsed.thinking_text, "hmm");
        assert_eq!(parsed.response_text, "ok");
    }

    #[test]
    fn error_result_carries_message() {
        let msg = parse_line(r#"{"type":"result","is_error":true,"error":"overloaded"}"#).unwrap();
        let parsed = parse_message(&msg, "", "");
        assert!(parsed.is_completed);
        assert_eq!(parsed.error.as_deref(), Some("overloaded"));
    }
}
