//! Unified streaming model across backends.
//!
//! Each backend has its own wire grammar (`alpha`, `beta`) and a parser
//! that flattens raw events into [`ParsedStreamMessage`], the single shape
//! the orchestration layer consumes. [`StreamAccumulator`] folds parsed
//! messages into the running turn state and computes deltas.

pub mod alpha;
pub mod beta;

use serde::{Deserialize, Serialize};

/// Structured result from parsing a backend stream event.
///
/// `response_text` and `thinking_text` are the full accumulated texts after
/// this event, never shortened: parsers receive the previous accumulation
/// and only ever extend it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedStreamMessage {
    pub response_text: String,
    pub thinking_text: String,
    /// Session/thread id if this event carried one.
    pub session_id: Option<String>,
    /// True if the skip tool was called in this event.
    pub skip_used: bool,
    /// New memory entries from memorize tool calls.
    pub memory_entries: Vec<String>,
    /// Situations passed to the policy-check tool.
    pub policy_check_calls: Vec<String>,
    /// True when a terminal event (turn completed) was observed.
    pub is_completed: bool,
    /// Error text when the backend reported a failed turn.
    pub error: Option<String>,
}

/// Incremental events produced by the accumulator for one parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    Content(String),
    Thinking(String),
}

/// Snapshot of a turn's rolling state, exposed for SSE catch-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingSnapshot {
    pub response_text: String,
    pub thinking_text: String,
    pub skip_used: bool,
}

/// Folds [`ParsedStreamMessage`]s into the running state of one turn.
///
/// Once the skip tool fires, the visible response text is cleared and later
/// content deltas are suppressed: text generated after a skip is the agent's
/// reason for skipping and must not reach the UI or the database. Thinking
/// deltas keep flowing.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    response_text: String,
    thinking_text: String,
    session_id: Option<String>,
    skip_used: bool,
    memory_entries: Vec<String>,
    policy_check_calls: Vec<String>,
    completed: bool,
    error: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated response text (full, including post-skip text).
    pub fn response_text(&self) -> &str {
        &self.response_text
    }

    pub fn thinking_text(&self) -> &str {
        &self.thinking_text
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn skip_used(&self) -> bool {
        self.skip_used
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn memory_entries(&self) -> &[String] {
        &self.memory_entries
    }

    pub fn policy_check_calls(&self) -> &[String] {
        &self.policy_check_calls
    }

    /// Mark the skip tool as used (hook-detected paths call this directly).
    pub fn mark_skip_used(&mut self) {
        self.skip_used = true;
    }

    /// Record a policy-check call observed outside the parser (hook path).
    pub fn record_policy_check(&mut self, situation: String) {
        self.policy_check_calls.push(situation);
    }

    /// Fold one parsed message in and return the deltas to emit.
    ///
    /// Content deltas are withheld once skip has fired; thinking deltas are
    /// always emitted.
    pub fn apply(&mut self, parsed: &ParsedStreamMessage) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();

        let content_delta = parsed.response_text[self.response_text.len()..].to_string();
        let thinking_delta = parsed.thinking_text[self.thinking_text.len()..].to_string();

        if parsed.session_id.is_some() {
            self.session_id.clone_from(&parsed.session_id);
        }
        if parsed.skip_used {
            self.skip_used = true;
        }
        self.memory_entries.extend(parsed.memory_entries.iter().cloned());
        self.policy_check_calls.extend(parsed.policy_check_calls.iter().cloned());
        if parsed.is_completed {
            self.completed = true;
        }
        if parsed.error.is_some() {
            self.error.clone_from(&parsed.error);
        }

        self.response_text.clone_from(&parsed.response_text);
        self.thinking_text.clone_from(&parsed.thinking_text);

        if !content_delta.is_empty() && !self.skip_used {
            deltas.push(StreamDelta::Content(content_delta));
        }
        if !thinking_delta.is_empty() {
            deltas.push(StreamDelta::Thinking(thinking_delta));
        }

        deltas
    }

    /// Current state for late SSE subscribers. When skip has fired the
    /// visible response text is empty.
    pub fn snapshot(&self) -> StreamingSnapshot {
        StreamingSnapshot {
            response_text: if self.skip_used {
                String::new()
            } else {
                self.response_text.clone()
            },
            thinking_text: self.thinking_text.clone(),
            skip_used: self.skip_used,
        }
    }

    /// Final response for persistence: `None` when skipped or empty.
    pub fn final_response(&self) -> Option<&str> {
        if self.skip_used || self.response_text.is_empty() {
            None
        } else {
            Some(&self.response_text)
        }
    }
}
