//! SQLite-backed storage.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::info;

use crate::domain::{
    Agent, AgentId, BackendKind, Message, MessageRole, NewMessage, ParticipantKind, PersonaConfig,
    Room, RoomId,
};

use super::{Storage, StorageError, unix_millis};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rooms (
    id INTEGER PRIMARY KEY,
    owner TEXT NOT NULL DEFAULT '',
    is_paused INTEGER NOT NULL DEFAULT 0,
    is_finished INTEGER NOT NULL DEFAULT 0,
    default_backend TEXT NOT NULL DEFAULT 'alpha',
    max_follow_up_rounds INTEGER NOT NULL DEFAULT 5,
    last_activity_at INTEGER NOT NULL DEFAULT 0,
    last_read_at INTEGER NOT NULL DEFAULT 0,
    follow_up_rounds_done INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    priority INTEGER NOT NULL DEFAULT 0,
    transparent INTEGER NOT NULL DEFAULT 0,
    interrupt_every_turn INTEGER NOT NULL DEFAULT 0,
    group_name TEXT NOT NULL DEFAULT 'default',
    persona TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS room_agents (
    room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (room_id, agent_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    images TEXT NOT NULL DEFAULT '[]',
    thinking TEXT,
    policy_check_calls TEXT NOT NULL DEFAULT '[]',
    participant TEXT NOT NULL,
    participant_name TEXT,
    agent_id INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_room_created
    ON messages(room_id, created_at);

CREATE TABLE IF NOT EXISTS session_bindings (
    room_id INTEGER NOT NULL,
    agent_id INTEGER NOT NULL,
    backend TEXT NOT NULL,
    session_id TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (room_id, agent_id, backend)
);
"#;

/// SQLite [`Storage`] implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) a database file and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Connection(e.to_string()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Self::with_pool(pool).await
    }

    /// Open an in-memory database (for tests).
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;
        info!("Database migrations complete");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert or replace a room row (administrative surface).
    pub async fn upsert_room(&self, room: &Room) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO rooms
                (id, owner, is_paused, is_finished, default_backend,
                 max_follow_up_rounds, last_activity_at, last_read_at,
                 follow_up_rounds_done)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(room.id.0)
        .bind(&room.owner)
        .bind(i64::from(room.is_paused))
        .bind(i64::from(room.is_finished))
        .bind(room.default_backend.as_str())
        .bind(i64::from(room.max_follow_up_rounds))
        .bind(room.last_activity_at)
        .bind(room.last_read_at)
        .bind(i64::from(room.follow_up_rounds_done))
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM room_agents WHERE room_id = ?")
            .bind(room.id.0)
            .execute(&self.pool)
            .await?;
        for (position, agent_id) in room.agent_ids.iter().enumerate() {
            sqlx::query("INSERT INTO room_agents (room_id, agent_id, position) VALUES (?, ?, ?)")
                .bind(room.id.0)
                .bind(agent_id.0)
                .bind(position as i64)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Insert or replace an agent row (administrative surface).
    pub async fn upsert_agent(&self, agent: &Agent) -> Result<(), StorageError> {
        let persona = serde_json::to_string(&agent.persona)
            .map_err(|e| StorageError::Query(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO agents
                (id, name, priority, transparent, interrupt_every_turn, group_name, persona)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(agent.id.0)
        .bind(&agent.name)
        .bind(i64::from(agent.priority))
        .bind(i64::from(agent.transparent))
        .bind(i64::from(agent.interrupt_every_turn))
        .bind(&agent.group)
        .bind(persona)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn room_agent_ids(&self, room_id: RoomId) -> Result<Vec<AgentId>, StorageError> {
        let rows = sqlx::query(
            "SELECT agent_id FROM room_agents WHERE room_id = ? ORDER BY position ASC",
        )
        .bind(room_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| AgentId(r.get::<i64, _>("agent_id")))
            .collect())
    }

    async fn room_from_row(&self, row: &SqliteRow) -> Result<Room, StorageError> {
        let id = RoomId(row.get::<i64, _>("id"));
        let backend: String = row.get("default_backend");
        Ok(Room {
            id,
            owner: row.get("owner"),
            agent_ids: self.room_agent_ids(id).await?,
            is_paused: row.get::<i64, _>("is_paused") != 0,
            is_finished: row.get::<i64, _>("is_finished") != 0,
            default_backend: backend
                .parse()
                .map_err(|e: String| StorageError::Query(e))?,
            max_follow_up_rounds: row.get::<i64, _>("max_follow_up_rounds") as u32,
            last_activity_at: row.get("last_activity_at"),
            last_read_at: row.get("last_read_at"),
            follow_up_rounds_done: row.get::<i64, _>("follow_up_rounds_done") as u32,
        })
    }
}

fn agent_from_row(row: &SqliteRow) -> Result<Agent, StorageError> {
    let persona_json: String = row.get("persona");
    let persona: PersonaConfig =
        serde_json::from_str(&persona_json).map_err(|e| StorageError::Query(e.to_string()))?;
    Ok(Agent {
        id: AgentId(row.get::<i64, _>("id")),
        name: row.get("name"),
        priority: row.get::<i64, _>("priority") as i32,
        transparent: row.get::<i64, _>("transparent") != 0,
        interrupt_every_turn: row.get::<i64, _>("interrupt_every_turn") != 0,
        group: row.get("group_name"),
        persona,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, StorageError> {
    let role: String = row.get("role");
    let participant: String = row.get("participant");
    let images_json: String = row.get("images");
    let calls_json: String = row.get("policy_check_calls");
    Ok(Message {
        id: row.get("id"),
        room_id: RoomId(row.get::<i64, _>("room_id")),
        role: MessageRole::from_str(&role).map_err(StorageError::Query)?,
        content: row.get("content"),
        images: serde_json::from_str(&images_json)
            .map_err(|e| StorageError::Query(e.to_string()))?,
        thinking: row.get("thinking"),
        policy_check_calls: serde_json::from_str(&calls_json)
            .map_err(|e| StorageError::Query(e.to_string()))?,
        participant: ParticipantKind::from_str(&participant).map_err(StorageError::Query)?,
        participant_name: row.get("participant_name"),
        agent_id: row.get::<Option<i64>, _>("agent_id").map(AgentId),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_room(&self, id: RoomId) -> Result<Room, StorageError> {
        let row = sqlx::query("SELECT * FROM rooms WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("Room {id}")))?;
        self.room_from_row(&row).await
    }

    async fn list_active_rooms(&self) -> Result<Vec<Room>, StorageError> {
        let rows =
            sqlx::query("SELECT * FROM rooms WHERE is_paused = 0 AND is_finished = 0 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        let mut rooms = Vec::with_capacity(rows.len());
        for row in &rows {
            rooms.push(self.room_from_row(row).await?);
        }
        Ok(rooms)
    }

    async fn mark_room_finished(&self, id: RoomId) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE rooms SET is_finished = 1 WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Room {id}")));
        }
        Ok(())
    }

    async fn touch_room_activity(
        &self,
        id: RoomId,
        reset_follow_ups: bool,
    ) -> Result<(), StorageError> {
        let now = unix_millis();
        let result = if reset_follow_ups {
            sqlx::query(
                "UPDATE rooms SET last_activity_at = ?, follow_up_rounds_done = 0, is_finished = 0
                 WHERE id = ?",
            )
            .bind(now)
            .bind(id.0)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE rooms SET last_activity_at = ? WHERE id = ?")
                .bind(now)
                .bind(id.0)
                .execute(&self.pool)
                .await?
        };
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("Room {id}")));
        }
        Ok(())
    }

    async fn increment_follow_up_rounds(&self, id: RoomId) -> Result<u32, StorageError> {
        sqlx::query("UPDATE rooms SET follow_up_rounds_done = follow_up_rounds_done + 1 WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        let row = sqlx::query("SELECT follow_up_rounds_done FROM rooms WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("Room {id}")))?;
        Ok(row.get::<i64, _>("follow_up_rounds_done") as u32)
    }

    async fn get_agent(&self, id: AgentId) -> Result<Agent, StorageError> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("Agent {id}")))?;
        agent_from_row(&row)
    }

    async fn get_room_agents(&self, room_id: RoomId) -> Result<Vec<Agent>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT a.* FROM agents a
            JOIN room_agents ra ON ra.agent_id = a.id
            WHERE ra.room_id = ?
            ORDER BY ra.position ASC
            "#,
        )
        .bind(room_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn get_all_messages(&self, room_id: RoomId) -> Result<Vec<Message>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE room_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(room_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn get_messages_after_agent(
        &self,
        room_id: RoomId,
        agent_id: AgentId,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let last = sqlx::query(
            "SELECT MAX(created_at) AS ts FROM messages WHERE room_id = ? AND agent_id = ?",
        )
        .bind(room_id.0)
        .bind(agent_id.0)
        .fetch_one(&self.pool)
        .await?;
        let last_ts: Option<i64> = last.get("ts");

        let rows = match last_ts {
            Some(ts) => {
                sqlx::query(
                    "SELECT * FROM messages WHERE room_id = ? AND created_at > ?
                     ORDER BY created_at ASC, id ASC LIMIT ?",
                )
                .bind(room_id.0)
                .bind(ts)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                // Agent has not spoken yet: most recent window, oldest first.
                let mut rows = sqlx::query(
                    "SELECT * FROM messages WHERE room_id = ?
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(room_id.0)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
                rows.reverse();
                rows
            }
        };
        rows.iter().map(message_from_row).collect()
    }

    async fn save_message(
        &self,
        room_id: RoomId,
        message: NewMessage,
    ) -> Result<Message, StorageError> {
        let images = serde_json::to_string(&message.images)
            .map_err(|e| StorageError::Query(e.to_string()))?;
        let calls = serde_json::to_string(&message.policy_check_calls)
            .map_err(|e| StorageError::Query(e.to_string()))?;

        // Timestamps stay strictly increasing within a room even when the
        // wall clock does not advance between inserts.
        let last = sqlx::query("SELECT MAX(created_at) AS ts FROM messages WHERE room_id = ?")
            .bind(room_id.0)
            .fetch_one(&self.pool)
            .await?;
        let last_ts: Option<i64> = last.get("ts");
        let created_at = unix_millis().max(last_ts.unwrap_or(0) + 1);

        let role = message.role.unwrap_or(MessageRole::User);
        let participant = message.participant.unwrap_or(ParticipantKind::User);

        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (room_id, role, content, images, thinking, policy_check_calls,
                 participant, participant_name, agent_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(room_id.0)
        .bind(role.as_str())
        .bind(&message.content)
        .bind(&images)
        .bind(&message.thinking)
        .bind(&calls)
        .bind(participant.as_str())
        .bind(&message.participant_name)
        .bind(message.agent_id.map(|a| a.0))
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE rooms SET last_activity_at = ? WHERE id = ?")
            .bind(created_at)
            .bind(room_id.0)
            .execute(&self.pool)
            .await?;

        Ok(Message {
            id: result.last_insert_rowid(),
            room_id,
            role,
            content: message.content,
            images: message.images,
            thinking: message.thinking,
            policy_check_calls: message.policy_check_calls,
            participant,
            participant_name: message.participant_name,
            agent_id: message.agent_id,
            created_at,
        })
    }

    async fn get_session_binding(
        &self,
        room_id: RoomId,
        agent_id: AgentId,
        backend: BackendKind,
    ) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(
            "SELECT session_id FROM session_bindings
             WHERE room_id = ? AND agent_id = ? AND backend = ?",
        )
        .bind(room_id.0)
        .bind(agent_id.0)
        .bind(backend.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("session_id")))
    }

    async fn set_session_binding(
        &self,
        room_id: RoomId,
        agent_id: AgentId,
        backend: BackendKind,
        session_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO session_bindings (room_id, agent_id, backend, session_id, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (room_id, agent_id, backend)
            DO UPDATE SET session_id = excluded.session_id, updated_at = excluded.updated_at
            "#,
        )
        .bind(room_id.0)
        .bind(agent_id.0)
        .bind(backend.as_str())
        .bind(session_id)
        .bind(unix_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::PersonaConfig;

    async fn seeded() -> SqliteStorage {
        let store = SqliteStorage::open_in_memory().await.unwrap();
        store
            .upsert_agent(&Agent {
                id: AgentId(1),
                name: "Ada".to_string(),
                priority: 0,
                transparent: false,
                interrupt_every_turn: false,
                group: "default".to_string(),
                persona: PersonaConfig::default(),
            })
            .await
            .unwrap();
        store
            .upsert_room(&Room {
                id: RoomId(1),
                owner: "owner".to_string(),
                agent_ids: vec![AgentId(1)],
                is_paused: false,
                is_finished: false,
                default_backend: BackendKind::Alpha,
                max_follow_up_rounds: 5,
                last_activity_at: 0,
                last_read_at: 0,
                follow_up_rounds_done: 0,
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn open_in_memory_works() {
        assert!(SqliteStorage::open_in_memory().await.is_ok());
    }

    #[tokio::test]
    async fn open_creates_the_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("roundtable.db");
        let store = SqliteStorage::open(&path).await.unwrap();
        store.close().await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn room_round_trips_with_members() {
        let store = seeded().await;
        let room = store.get_room(RoomId(1)).await.unwrap();
        assert_eq!(room.agent_ids, vec![AgentId(1)]);
        assert_eq!(room.default_backend, BackendKind::Alpha);
    }

    #[tokio::test]
    async fn messages_keep_total_order() {
        let store = seeded().await;
        let mut last = 0;
        for i in 0..5 {
            let saved = store
                .save_message(RoomId(1), NewMessage::user(format!("m{i}")))
                .await
                .unwrap();
            assert!(saved.created_at > last);
            last = saved.created_at;
        }
        let all = store.get_all_messages(RoomId(1)).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[tokio::test]
    async fn after_agent_query_matches_memory_semantics() {
        let store = seeded().await;
        store
            .save_message(RoomId(1), NewMessage::user("hi"))
            .await
            .unwrap();
        store
            .save_message(RoomId(1), NewMessage::assistant(AgentId(1), "hello"))
            .await
            .unwrap();
        store
            .save_message(RoomId(1), NewMessage::user("again"))
            .await
            .unwrap();

        let after = store
            .get_messages_after_agent(RoomId(1), AgentId(1), 25)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].content, "again");
    }

    #[tokio::test]
    async fn session_binding_upserts() {
        let store = seeded().await;
        store
            .set_session_binding(RoomId(1), AgentId(1), BackendKind::Beta, "T1")
            .await
            .unwrap();
        store
            .set_session_binding(RoomId(1), AgentId(1), BackendKind::Beta, "T2")
            .await
            .unwrap();
        let bound = store
            .get_session_binding(RoomId(1), AgentId(1), BackendKind::Beta)
            .await
            .unwrap();
        assert_eq!(bound.as_deref(), Some("T2"));
    }

    #[tokio::test]
    async fn message_with_images_round_trips() {
        let store = seeded().await;
        let mut msg = NewMessage::user("look");
        msg.images.push(crate::domain::InlineImage {
            data: "aGk=".to_string(),
            media_type: "image/png".to_string(),
        });
        store.save_message(RoomId(1), msg).await.unwrap();

        let all = store.get_all_messages(RoomId(1)).await.unwrap();
        assert_eq!(all[0].images.len(), 1);
        assert_eq!(all[0].images[0].media_type, "image/png");
    }
}
