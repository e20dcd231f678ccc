//! Domain model: rooms, agents, messages, task identifiers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Content of a persisted turn in which the agent chose not to speak.
/// Such rows are invisible to other agents when building context.
pub const SKIP_MESSAGE_TEXT: &str = "(skipped)";

/// Room identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub i64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Agent identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub i64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key into the client pool, active-client map and streaming-state map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub room_id: RoomId,
    pub agent_id: AgentId,
}

impl TaskId {
    pub const fn new(room_id: RoomId, agent_id: AgentId) -> Self {
        Self { room_id, agent_id }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "room-{}-agent-{}", self.room_id, self.agent_id)
    }
}

/// The two supported backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Alpha,
    Beta,
}

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alpha => "alpha",
            Self::Beta => "beta",
        }
    }

    /// Database column name of this backend's session binding.
    pub const fn session_field_name(self) -> &'static str {
        match self {
            Self::Alpha => "alpha_session_id",
            Self::Beta => "beta_thread_id",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alpha" => Ok(Self::Alpha),
            "beta" => Ok(Self::Beta),
            other => Err(format!("Unknown backend: {other}")),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A multi-party chat scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub owner: String,
    pub agent_ids: Vec<AgentId>,
    pub is_paused: bool,
    pub is_finished: bool,
    pub default_backend: BackendKind,
    /// Ceiling on orchestrator-initiated follow-up rounds after the last
    /// user message.
    pub max_follow_up_rounds: u32,
    /// Unix millis of the last activity in the room.
    pub last_activity_at: i64,
    /// Unix millis of the owner's last read position.
    pub last_read_at: i64,
    /// Follow-up rounds run since the last user message.
    pub follow_up_rounds_done: u32,
}

/// Persona configuration blob loaded from the agent's config folder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub summary: String,
    pub characteristics: String,
    pub recent_events: String,
    /// Long-term memory index keyed by subtitle, recalled via the recall
    /// tool.
    #[serde(default)]
    pub long_term_memory_index: BTreeMap<String, String>,
    /// Folder the persona files live in; handed to tool servers via env.
    #[serde(default)]
    pub config_dir: Option<String>,
}

/// A persona driven by one of the backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    /// Positive speaks earlier, zero is regular, negative speaks later.
    pub priority: i32,
    /// A transparent agent's utterance does not trigger interrupt agents.
    pub transparent: bool,
    /// Reacts to the user and to every non-transparent utterance.
    pub interrupt_every_turn: bool,
    /// Group label used to select tool config overrides.
    pub group: String,
    pub persona: PersonaConfig,
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    User,
    Character,
    SituationBuilder,
    System,
}

impl ParticipantKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Character => "character",
            Self::SituationBuilder => "situation_builder",
            Self::System => "system",
        }
    }
}

impl FromStr for ParticipantKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "character" => Ok(Self::Character),
            "situation_builder" => Ok(Self::SituationBuilder),
            "system" => Ok(Self::System),
            other => Err(format!("Unknown participant kind: {other}")),
        }
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("Unknown message role: {other}")),
        }
    }
}

/// Base64 inline image attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineImage {
    pub data: String,
    pub media_type: String,
}

/// A persisted room message. Append-only; ordering is the DB-assigned
/// timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub room_id: RoomId,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub images: Vec<InlineImage>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub policy_check_calls: Vec<String>,
    pub participant: ParticipantKind,
    #[serde(default)]
    pub participant_name: Option<String>,
    /// Back-reference to the authoring agent for assistant messages.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    /// Unix millis assigned by the store.
    pub created_at: i64,
}

impl Message {
    /// True for rows that are invisible to other agents.
    pub fn is_skip_marker(&self) -> bool {
        self.content == SKIP_MESSAGE_TEXT
    }
}

/// Fields of a new message handed to the store.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub role: Option<MessageRole>,
    pub content: String,
    pub images: Vec<InlineImage>,
    pub thinking: Option<String>,
    pub policy_check_calls: Vec<String>,
    pub participant: Option<ParticipantKind>,
    pub participant_name: Option<String>,
    pub agent_id: Option<AgentId>,
}

impl NewMessage {
    /// An assistant message authored by `agent_id`.
    pub fn assistant(agent_id: AgentId, content: impl Into<String>) -> Self {
        Self {
            role: Some(MessageRole::Assistant),
            content: content.into(),
            participant: Some(ParticipantKind::Character),
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Some(MessageRole::User),
            content: content.into(),
            participant: Some(ParticipantKind::User),
            ..Default::default()
        }
    }
}
