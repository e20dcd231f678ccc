//! Backend-B stream event grammar and parser.
//!
//! Backend-B is an app-server subprocess speaking JSON-RPC. Two wire shapes
//! must both be supported: streaming notifications
//! (`item/agentMessage/delta`, `item/reasoning/textDelta`, `turn/started`,
//! `item/mcpToolCall/*`, `turn/completed`) and completed-item events
//! (`response_item` with assistant content blocks). A `thread.started`
//! event carries the thread id used for session bindings.

use serde_json::Value;
use tracing::debug;

use super::ParsedStreamMessage;

/// Tool names exposed to agents over MCP. Namespaced variants are matched
/// by suffix.
const SKIP_TOOL: &str = "skip";
const MEMORIZE_TOOL: &str = "memorize";
const POLICY_CHECK_TOOL: &str = "policy_check";

/// Terminal status of a backend-B turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Failed,
    Interrupted,
    NeedsApproval,
    Unknown(String),
}

impl TurnStatus {
    fn from_str(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "interrupted" => Self::Interrupted,
            "needsApproval" => Self::NeedsApproval,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Content block inside a completed assistant item.
#[derive(Debug, Clone, PartialEq)]
pub enum BetaBlock {
    OutputText { text: String },
    Reasoning { text: String },
    ToolUse { name: String, input: Value },
}

/// Canonical backend-B stream events.
#[derive(Debug, Clone, PartialEq)]
pub enum BetaEvent {
    ThreadStarted { thread_id: String },
    TurnStarted { turn_id: String },
    AgentMessageDelta { delta: String },
    ReasoningDelta { delta: String },
    McpToolCall { name: String, arguments: Value },
    TurnCompleted { status: TurnStatus, error: Option<String> },
    ResponseItem { role: String, content: Vec<BetaBlock> },
    Unknown { method: String, payload: Value },
}

/// Parse a JSON-RPC notification (`method` + `params`) into a canonical
/// event.
pub fn parse_notification(method: &str, params: &Value) -> BetaEvent {
    match method {
        "thread.started" | "thread/started" => BetaEvent::ThreadStarted {
            thread_id: str_field(params, "threadId").unwrap_or_default(),
        },
        "turn/started" => BetaEvent::TurnStarted {
            turn_id: str_field(params, "turnId").unwrap_or_default(),
        },
        "item/agentMessage/delta" => BetaEvent::AgentMessageDelta {
            delta: str_field(params, "delta").unwrap_or_default(),
        },
        "item/reasoning/textDelta" => BetaEvent::ReasoningDelta {
            delta: str_field(params, "delta").unwrap_or_default(),
        },
        "item/mcpToolCall/started" | "item/mcpToolCall/completed" => BetaEvent::McpToolCall {
            name: str_field(params, "name").unwrap_or_default(),
            arguments: params.get("arguments").cloned().unwrap_or(Value::Null),
        },
        "turn/completed" => BetaEvent::TurnCompleted {
            status: TurnStatus::from_str(&str_field(params, "status").unwrap_or_default()),
            error: extract_error(params),
        },
        other => parse_typed_event(other, params),
    }
}

/// Parse a bare event object (`{"type": …, "payload": …}`), the
/// completed-item wire shape.
pub fn parse_event(raw: &Value) -> BetaEvent {
    let event_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let payload = raw.get("payload").unwrap_or(raw);
    parse_typed_event(event_type, payload)
}

fn parse_typed_event(event_type: &str, payload: &Value) -> BetaEvent {
    match event_type {
        "response_item" => {
            let role = str_field(payload, "role").unwrap_or_default();
            let content = payload
                .get("content")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(parse_block).collect())
                .unwrap_or_default();
            BetaEvent::ResponseItem { role, content }
        }
        "response_completed" | "turn_completed" => BetaEvent::TurnCompleted {
            status: TurnStatus::Completed,
            error: None,
        },
        other => {
            debug!(event_type = other, "Unknown app-server event");
            BetaEvent::Unknown {
                method: other.to_string(),
                payload: payload.clone(),
            }
        }
    }
}

fn parse_block(block: &Value) -> Option<BetaBlock> {
    let block_type = block.get("type")?.as_str()?;
    match block_type {
        "output_text" | "text" => Some(BetaBlock::OutputText {
            text: block.get("text")?.as_str()?.to_string(),
        }),
        "reasoning" => Some(BetaBlock::Reasoning {
            text: block.get("text")?.as_str()?.to_string(),
        }),
        "tool_use" => Some(BetaBlock::ToolUse {
            name: block.get("name")?.as_str()?.to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        _ => None,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn extract_error(params: &Value) -> Option<String> {
    for key in ["error", "errorInfo", "codexErrorInfo"] {
        match params.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Object(obj)) => {
                if let Some(msg) = obj.get("message").and_then(|v| v.as_str()) {
                    return Some(msg.to_string());
                }
                return Some(Value::Object(obj.clone()).to_string());
            }
            _ => {}
        }
    }
    None
}

fn tool_name_matches(name: &str, tool: &str) -> bool {
    name == tool || name.ends_with(&format!("__{tool}"))
}

/// Pure parser: one backend-B event in, the extended accumulation out.
///
/// Backend-B has no hook path; skip, memorize and policy-check are all
/// recognized here from MCP tool-call events.
pub fn parse_message(
    event: &BetaEvent,
    current_response: &str,
    current_thinking: &str,
) -> ParsedStreamMessage {
    let mut parsed = ParsedStreamMessage {
        response_text: current_response.to_string(),
        thinking_text: current_thinking.to_string(),
        ..Default::default()
    };

    match event {
        BetaEvent::ThreadStarted { thread_id } => {
            if !thread_id.is_empty() {
                parsed.session_id = Some(thread_id.clone());
            }
        }
        BetaEvent::AgentMessageDelta { delta } => parsed.response_text.push_str(delta),
        BetaEvent::ReasoningDelta { delta } => parsed.thinking_text.push_str(delta),
        BetaEvent::McpToolCall { name, arguments } => {
            apply_tool_call(&mut parsed, name, arguments);
        }
        BetaEvent::TurnCompleted { status, error } => {
            parsed.is_completed = true;
            if *status == TurnStatus::Failed {
                parsed.error = Some(
                    error
                        .clone()
                        .unwrap_or_else(|| "turn failed".to_string()),
                );
            }
        }
        BetaEvent::ResponseItem { role, content } => {
            if role == "assistant" {
                for block in content {
                    match block {
                        BetaBlock::OutputText { text } => parsed.response_text.push_str(text),
                        BetaBlock::Reasoning { text } => parsed.thinking_text.push_str(text),
                        BetaBlock::ToolUse { name, input } => {
                            apply_tool_call(&mut parsed, name, input);
                        }
                    }
                }
            }
        }
        BetaEvent::TurnStarted { .. } | BetaEvent::Unknown { .. } => {}
    }

    parsed
}

fn apply_tool_call(parsed: &mut ParsedStreamMessage, name: &str, arguments: &Value) {
    if tool_name_matches(name, SKIP_TOOL) {
        parsed.skip_used = true;
    } else if tool_name_matches(name, MEMORIZE_TOOL) {
        if let Some(entry) = arguments.get("memory_entry").and_then(|v| v.as_str()) {
            if !entry.is_empty() {
                parsed.memory_entries.push(entry.to_string());
            }
        }
    } else if tool_name_matches(name, POLICY_CHECK_TOOL) {
        if let Some(situation) = arguments.get("situation").and_then(|v| v.as_str()) {
            parsed.policy_check_calls.push(situation.to_string());
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_delta_extends_response() {
        let event = parse_notification("item/agentMessage/delta", &json!({"delta": "lo"}));
        let parsed = parse_message(&event, "Hel", "");
        assert_eq!(parsed.response_text, "Hello");
    }

    #[test]
    fn reasoning_delta_extends_thinking() {
        let event = parse_notification("item/reasoning/textDelta", &json!({"delta": "why"}));
        let parsed = parse_message(&event, "", "x");
        assert_eq!(parsed.thinking_text, "xwhy");
    }

    #[test]
    fn thread_started_carries_session() {
        let event = parse_notification("thread.started", &json!({"threadId": "T1"}));
        let parsed = parse_message(&event, "", "");
        assert_eq!(parsed.session_id.as_deref(), Some("T1"));
    }

    #[test]
    fn skip_tool_call_sets_flag() {
        let event = parse_notification(
            "item/mcpToolCall/completed",
            &json!({"name": "mcp__social__skip", "arguments": {}}),
        );
        let parsed = parse_message(&event, "", "");
        assert!(parsed.skip_used);
    }

    #[test]
    fn memorize_tool_call_collects_entry() {
        let event = parse_notification(
            "item/mcpToolCall/completed",
            &json!({"name": "memorize", "arguments": {"memory_entry": "owns a cat"}}),
        );
        let parsed = parse_message(&event, "", "");
        assert_eq!(parsed.memory_entries, vec!["owns a cat".to_string()]);
    }

    #[test]
    fn policy_check_collects_situation() {
        let event = parse_notification(
            "item/mcpToolCall/started",
            &json!({"name": "policy_check", "arguments": {"situation": "sensitive ask"}}),
        );
        let parsed = parse_message(&event, "", "");
        assert_eq!(parsed.policy_check_calls, vec!["sensitive ask".to_string()]);
    }

    #[test]
    fn failed_turn_reports_error() {
        let event = parse_notification(
            "turn/completed",
            &json!({"status": "failed", "error": {"message": "model overloaded"}}),
        );
        let parsed = parse_message(&event, "partial", "");
        assert!(parsed.is_completed);
        assert_eq!(parsed.error.as_deref(), Some("model overloaded"));
        // Partial text is preserved alongside the error.
        assert_eq!(parsed.response_text, "partial");
    }

    #[test]
    fn completed_turn_has_no_error() {
        let event = parse_notification("turn/completed", &json!({"status": "completed"}));
        let parsed = parse_message(&event, "", "");
        assert!(parsed.is_completed);
        assert!(parsed.error.is_none());
    }

    #[test]
    fn response_item_assistant_blocks() {
        let raw = json!({
            "type": "response_item",
            "payload": {
                "type": "message",
                "role": "assistant",
                "content": [
                    {"type": "output_text", "text": "Hi"},
                    {"type": "reasoning", "text": "greet back"},
                ],
            },
        });
        let parsed = parse_message(&parse_event(&raw), "", "");
        assert_eq!(parsed.response_text, "Hi");
        assert_eq!(parsed.thinking_text, "greet back");
    }

    #[test]
    fn response_item_user_role_is_ignored() {
        let raw = json!({
            "type": "response_item",
            "payload": {
                "type": "message",
                "role": "user",
                "content": [{"type": "text", "text": "echo"}],
            },
        });
        let parsed = parse_message(&parse_event(&raw), "", "");
        assert_eq!(parsed.response_text, "");
    }
}
