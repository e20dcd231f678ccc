//! Server-Sent-Event fan-out.

mod broadcaster;
mod tickets;

pub use broadcaster::{EventBroadcaster, SseConnection, event_stream};
pub use tickets::{generate_ticket, validate_ticket};

use serde::{Deserialize, Serialize};

use crate::domain::{AgentId, Message};

/// Events streamed to room subscribers. Serialized as JSON objects with a
/// `type` tag, UTF-8.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// An agent started generating. Carries the accumulated state snapshot
    /// when synthesized for late subscribers.
    StreamStart {
        temp_id: String,
        agent_id: AgentId,
        #[serde(default)]
        agent_name: Option<String>,
        #[serde(default)]
        response_text: String,
        #[serde(default)]
        thinking_text: String,
    },
    ContentDelta {
        temp_id: String,
        delta: String,
    },
    ThinkingDelta {
        temp_id: String,
        delta: String,
    },
    StreamEnd {
        temp_id: String,
        agent_id: AgentId,
        response_text: Option<String>,
        #[serde(default)]
        thinking_text: String,
        session_id: Option<String>,
        #[serde(default)]
        memory_entries: Vec<String>,
        #[serde(default)]
        policy_check_calls: Vec<String>,
        skipped: bool,
    },
    /// Broadcast after the message row is committed, so a client reacting
    /// to `stream_end` never sees a referenced-but-unreadable message.
    NewMessage {
        message: Message,
    },
    Keepalive {
        timestamp: i64,
    },
    Shutdown,
}
