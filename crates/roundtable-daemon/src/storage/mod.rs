//! Persistence layer: rooms, agents, messages, session bindings.
//!
//! The orchestration engine only sees the [`Storage`] trait. Production
//! runs on SQLite ([`SqliteStorage`]); tests use [`MemoryStorage`].

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;

use crate::domain::{Agent, AgentId, BackendKind, Message, NewMessage, Room, RoomId};

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Persistence contract consumed by the orchestration engine.
///
/// Message timestamps are store-assigned and strictly increasing within a
/// room, so a room's messages form a total order and reads are always a
/// prefix of later reads.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_room(&self, id: RoomId) -> Result<Room, StorageError>;

    /// Rooms that are neither paused nor finished.
    async fn list_active_rooms(&self) -> Result<Vec<Room>, StorageError>;

    async fn mark_room_finished(&self, id: RoomId) -> Result<(), StorageError>;

    /// Stamp room activity; on user messages the follow-up counter resets.
    async fn touch_room_activity(&self, id: RoomId, reset_follow_ups: bool)
        -> Result<(), StorageError>;

    async fn increment_follow_up_rounds(&self, id: RoomId) -> Result<u32, StorageError>;

    async fn get_agent(&self, id: AgentId) -> Result<Agent, StorageError>;

    /// Member agents of a room, in member order.
    async fn get_room_agents(&self, room_id: RoomId) -> Result<Vec<Agent>, StorageError>;

    async fn get_all_messages(&self, room_id: RoomId) -> Result<Vec<Message>, StorageError>;

    /// Messages strictly after the agent's last authored message; the most
    /// recent `limit` messages when the agent has not spoken yet.
    async fn get_messages_after_agent(
        &self,
        room_id: RoomId,
        agent_id: AgentId,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError>;

    async fn save_message(
        &self,
        room_id: RoomId,
        message: NewMessage,
    ) -> Result<Message, StorageError>;

    async fn get_session_binding(
        &self,
        room_id: RoomId,
        agent_id: AgentId,
        backend: BackendKind,
    ) -> Result<Option<String>, StorageError>;

    async fn set_session_binding(
        &self,
        room_id: RoomId,
        agent_id: AgentId,
        backend: BackendKind,
        session_id: &str,
    ) -> Result<(), StorageError>;
}

/// Current time as Unix milliseconds.
pub(crate) fn unix_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
