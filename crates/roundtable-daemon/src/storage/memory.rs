//! In-memory storage for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{
    Agent, AgentId, BackendKind, Message, MessageRole, NewMessage, ParticipantKind, Room, RoomId,
};

use super::{Storage, StorageError, unix_millis};

#[derive(Default)]
struct Inner {
    rooms: HashMap<RoomId, Room>,
    agents: HashMap<AgentId, Agent>,
    messages: HashMap<RoomId, Vec<Message>>,
    bindings: HashMap<(RoomId, AgentId, BackendKind), String>,
    next_message_id: i64,
}

/// Map-backed [`Storage`] implementation.
///
/// Timestamps are forced strictly increasing per room so ordering tests
/// behave like the SQLite store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room.
    pub async fn put_room(&self, room: Room) {
        self.inner.write().await.rooms.insert(room.id, room);
    }

    /// Seed an agent.
    pub async fn put_agent(&self, agent: Agent) {
        self.inner.write().await.agents.insert(agent.id, agent);
    }

    pub async fn set_paused(&self, id: RoomId, paused: bool) {
        if let Some(room) = self.inner.write().await.rooms.get_mut(&id) {
            room.is_paused = paused;
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_room(&self, id: RoomId) -> Result<Room, StorageError> {
        self.inner
            .read()
            .await
            .rooms
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("Room {id}")))
    }

    async fn list_active_rooms(&self) -> Result<Vec<Room>, StorageError> {
        let inner = self.inner.read().await;
        let mut rooms: Vec<Room> = inner
            .rooms
            .values()
            .filter(|r| !r.is_paused && !r.is_finished)
            .cloned()
            .collect();
        rooms.sort_by_key(|r| r.id);
        Ok(rooms)
    }

    async fn mark_room_finished(&self, id: RoomId) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let room = inner
            .rooms
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("Room {id}")))?;
        room.is_finished = true;
        Ok(())
    }

    async fn touch_room_activity(
        &self,
        id: RoomId,
        reset_follow_ups: bool,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let room = inner
            .rooms
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("Room {id}")))?;
        room.last_activity_at = unix_millis();
        if reset_follow_ups {
            room.follow_up_rounds_done = 0;
            room.is_finished = false;
        }
        Ok(())
    }

    async fn increment_follow_up_rounds(&self, id: RoomId) -> Result<u32, StorageError> {
        let mut inner = self.inner.write().await;
        let room = inner
            .rooms
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("Room {id}")))?;
        room.follow_up_rounds_done += 1;
        Ok(room.follow_up_rounds_done)
    }

    async fn get_agent(&self, id: AgentId) -> Result<Agent, StorageError> {
        self.inner
            .read()
            .await
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("Agent {id}")))
    }

    async fn get_room_agents(&self, room_id: RoomId) -> Result<Vec<Agent>, StorageError> {
        let inner = self.inner.read().await;
        let room = inner
            .rooms
            .get(&room_id)
            .ok_or_else(|| StorageError::NotFound(format!("Room {room_id}")))?;
        Ok(room
            .agent_ids
            .iter()
            .filter_map(|id| inner.agents.get(id).cloned())
            .collect())
    }

    async fn get_all_messages(&self, room_id: RoomId) -> Result<Vec<Message>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .get(&room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_messages_after_agent(
        &self,
        room_id: RoomId,
        agent_id: AgentId,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let inner = self.inner.read().await;
        let messages = inner.messages.get(&room_id).cloned().unwrap_or_default();

        let last_idx = messages
            .iter()
            .rposition(|m| m.agent_id == Some(agent_id));

        let window: Vec<Message> = match last_idx {
            Some(idx) => messages[idx + 1..].to_vec(),
            None => {
                let start = messages.len().saturating_sub(limit);
                messages[start..].to_vec()
            }
        };
        Ok(window.into_iter().take(limit).collect())
    }

    async fn save_message(
        &self,
        room_id: RoomId,
        message: NewMessage,
    ) -> Result<Message, StorageError> {
        let mut inner = self.inner.write().await;
        if !inner.rooms.contains_key(&room_id) {
            return Err(StorageError::NotFound(format!("Room {room_id}")));
        }

        inner.next_message_id += 1;
        let id = inner.next_message_id;

        let room_messages = inner.messages.entry(room_id).or_default();
        let last_ts = room_messages.last().map_or(0, |m| m.created_at);
        let created_at = unix_millis().max(last_ts + 1);

        let saved = Message {
            id,
            room_id,
            role: message.role.unwrap_or(MessageRole::User),
            content: message.content,
            images: message.images,
            thinking: message.thinking,
            policy_check_calls: message.policy_check_calls,
            participant: message.participant.unwrap_or(ParticipantKind::User),
            participant_name: message.participant_name,
            agent_id: message.agent_id,
            created_at,
        };
        room_messages.push(saved.clone());

        if let Some(room) = inner.rooms.get_mut(&room_id) {
            room.last_activity_at = created_at;
        }

        Ok(saved)
    }

    async fn get_session_binding(
        &self,
        room_id: RoomId,
        agent_id: AgentId,
        backend: BackendKind,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .bindings
            .get(&(room_id, agent_id, backend))
            .cloned())
    }

    async fn set_session_binding(
        &self,
        room_id: RoomId,
        agent_id: AgentId,
        backend: BackendKind,
        session_id: &str,
    ) -> Result<(), StorageError> {
        self.inner
            .write()
            .await
            .bindings
            .insert((room_id, agent_id, backend), session_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::PersonaConfig;

    fn room(id: i64) -> Room {
        Room {
            id: RoomId(id),
            owner: "owner".to_string(),
            agent_ids: vec![AgentId(1)],
            is_paused: false,
            is_finished: false,
            default_backend: BackendKind::Alpha,
            max_follow_up_rounds: 5,
            last_activity_at: 0,
            last_read_at: 0,
            follow_up_rounds_done: 0,
        }
    }

    fn agent(id: i64, name: &str) -> Agent {
        Agent {
            id: AgentId(id),
            name: name.to_string(),
            priority: 0,
            transparent: false,
            interrupt_every_turn: false,
            group: "default".to_string(),
            persona: PersonaConfig::default(),
        }
    }

    #[tokio::test]
    async fn message_order_is_total_per_room() {
        let store = MemoryStorage::new();
        store.put_room(room(1)).await;

        let mut last = 0;
        for i in 0..5 {
            let saved = store
                .save_message(RoomId(1), NewMessage::user(format!("m{i}")))
                .await
                .unwrap();
            assert!(saved.created_at > last, "timestamps must strictly increase");
            last = saved.created_at;
        }
    }

    #[tokio::test]
    async fn after_agent_filter_returns_suffix() {
        let store = MemoryStorage::new();
        store.put_room(room(1)).await;
        store.put_agent(agent(1, "Ada")).await;

        store
            .save_message(RoomId(1), NewMessage::user("hi"))
            .await
            .unwrap();
        store
            .save_message(RoomId(1), NewMessage::assistant(AgentId(1), "hello"))
            .await
            .unwrap();
        store
            .save_message(RoomId(1), NewMessage::user("how are you?"))
            .await
            .unwrap();

        let after = store
            .get_messages_after_agent(RoomId(1), AgentId(1), 25)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].content, "how are you?");
    }

    #[tokio::test]
    async fn after_agent_falls_back_to_recent_window() {
        let store = MemoryStorage::new();
        store.put_room(room(1)).await;

        for i in 0..10 {
            store
                .save_message(RoomId(1), NewMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }

        let window = store
            .get_messages_after_agent(RoomId(1), AgentId(9), 3)
            .await
            .unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].content, "m7");
    }

    #[tokio::test]
    async fn session_bindings_are_per_backend() {
        let store = MemoryStorage::new();
        store
            .set_session_binding(RoomId(1), AgentId(1), BackendKind::Alpha, "s-1")
            .await
            .unwrap();

        let alpha = store
            .get_session_binding(RoomId(1), AgentId(1), BackendKind::Alpha)
            .await
            .unwrap();
        let beta = store
            .get_session_binding(RoomId(1), AgentId(1), BackendKind::Beta)
            .await
            .unwrap();
        assert_eq!(alpha.as_deref(), Some("s-1"));
        assert!(beta.is_none());
    }

    #[tokio::test]
    async fn touch_resets_follow_ups_on_user_message() {
        let store = MemoryStorage::new();
        store.put_room(room(1)).await;
        store.increment_follow_up_rounds(RoomId(1)).await.unwrap();
        store.increment_follow_up_rounds(RoomId(1)).await.unwrap();

        store.touch_room_activity(RoomId(1), true).await.unwrap();
        let room = store.get_room(RoomId(1)).await.unwrap();
        assert_eq!(room.follow_up_rounds_done, 0);
    }

    #[tokio::test]
    async fn finished_rooms_are_not_active() {
        let store = MemoryStorage::new();
        store.put_room(room(1)).await;
        store.put_room(room(2)).await;
        store.mark_room_finished(RoomId(2)).await.unwrap();

        let active = store.list_active_rooms().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, RoomId(1));
    }
}
