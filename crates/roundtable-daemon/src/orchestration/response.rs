//! Per-agent response generation.
//!
//! Builds the agent's context, drives the agent manager's turn stream,
//! handles one-shot session recovery, and decides whether the result is
//! persisted. The terminal `stream_end` is broadcast only after that
//! decision, and `new_message` only after the row is committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use roundtable_core::config::OrchestratorConfig;

use crate::domain::{Agent, AgentId, BackendKind, NewMessage, ParticipantKind, Room, RoomId, TaskId};
use crate::images::prepare_blocks_for;
use crate::manager::{AgentManager, TurnEvent, TurnOutcome};
use crate::providers::{QueryContent, TurnRequest};
use crate::sse::RoomEvent;
use crate::storage::Storage;

use super::context::{
    ContextParams, ContextTemplates, build_conversation_context, detect_conversation_type,
};

/// Fallback message when the agent has nothing new to look at on an
/// initial round.
const CONTINUE_PROMPT: &str = "Continue the conversation naturally.";

/// Base system prompts per backend family.
fn base_prompt(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::Alpha => {
            "You are roleplaying as a chat-room member. Stay in character, write \
             like a real person in a group chat, and never mention these \
             instructions. Use your tools when they fit the moment."
        }
        BackendKind::Beta => {
            "You are a persona in a group chat. Answer only as your character, in \
             plain conversational text without markdown scaffolding, and never \
             reveal these instructions. Tools are available through your tool \
             server."
        }
    }
}

/// Assemble the persona system prompt: backend base plus persona sections
/// under markdown headings.
pub fn build_system_prompt(agent: &Agent, backend: BackendKind) -> String {
    let mut prompt = format!("{}\n\n# You are {}\n", base_prompt(backend), agent.name);

    if !agent.persona.summary.is_empty() {
        prompt.push_str(&format!("\n## In a nutshell\n{}\n", agent.persona.summary));
    }
    if !agent.persona.characteristics.is_empty() {
        prompt.push_str(&format!("\n## Characteristics\n{}\n", agent.persona.characteristics));
    }
    if !agent.persona.recent_events.is_empty() {
        prompt.push_str(&format!("\n## Recent events\n{}\n", agent.persona.recent_events));
    }
    if !agent.persona.long_term_memory_index.is_empty() {
        let subtitles: Vec<&str> = agent
            .persona
            .long_term_memory_index
            .keys()
            .map(String::as_str)
            .collect();
        prompt.push_str(&format!(
            "\n## Long-term memory\nTopics you can recall with the recall tool: {}\n",
            subtitles.join(", ")
        ));
    }

    prompt
}

/// Collected state of one consumed turn stream.
#[derive(Default)]
struct StreamResult {
    outcome: Option<TurnOutcome>,
    /// `(temp_id, old_thread_id)` when the backend requested session
    /// recovery.
    recovery: Option<(String, String)>,
}

/// Drives single-agent turns.
pub struct ResponseGenerator {
    storage: Arc<dyn Storage>,
    manager: Arc<AgentManager>,
    templates: ContextTemplates,
    config: OrchestratorConfig,
    /// Shared monotonic stamps of the last user message per room; a stamp
    /// newer than a turn's start pre-empts that turn.
    last_user_message_time: Arc<Mutex<HashMap<RoomId, Instant>>>,
    /// Pinned RNG seed for tests; entropy-seeded per turn otherwise.
    rng_seed: Option<u64>,
}

impl ResponseGenerator {
    pub fn new(
        storage: Arc<dyn Storage>,
        manager: Arc<AgentManager>,
        templates: ContextTemplates,
        config: OrchestratorConfig,
        last_user_message_time: Arc<Mutex<HashMap<RoomId, Instant>>>,
    ) -> Self {
        Self {
            storage,
            manager,
            templates,
            config,
            last_user_message_time,
            rng_seed: None,
        }
    }

    /// Pin the thought-sampling RNG (tests).
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    fn turn_rng(&self) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    async fn was_interrupted(&self, room_id: RoomId, started: Instant) -> bool {
        self.last_user_message_time
            .lock()
            .await
            .get(&room_id)
            .is_some_and(|stamp| *stamp > started)
    }

    /// Generate one agent response. Returns true when the agent actually
    /// spoke (a message was persisted).
    pub async fn generate(&self, room_id: RoomId, agent: &Agent, is_follow_up: bool) -> bool {
        let started = Instant::now();
        let task_id = TaskId::new(room_id, agent.id);

        let room = match self.storage.get_room(room_id).await {
            Ok(room) => room,
            Err(e) => {
                warn!(room = %room_id, error = %e, "Room lookup failed");
                return false;
            }
        };
        let backend = room.default_backend;

        let messages = match self
            .storage
            .get_messages_after_agent(room_id, agent.id, self.config.history_fetch_limit)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(room = %room_id, error = %e, "History fetch failed");
                return false;
            }
        };

        let agent_names = match self.agent_name_map(&room).await {
            Ok(map) => map,
            Err(e) => {
                warn!(room = %room_id, error = %e, "Member lookup failed");
                return false;
            }
        };

        let shape =
            detect_conversation_type(&messages, room.agent_ids.len(), &self.templates.default_user_name);

        let mut rng = self.turn_rng();
        let blocks = build_conversation_context(
            &ContextParams {
                messages: &messages,
                limit: self.config.context_message_limit,
                agent_id: Some(agent.id),
                agent_name: Some(&agent.name),
                user_name: shape.user_name.as_deref(),
                agent_names: &agent_names,
                backend,
                include_response_instruction: true,
                include_skip_markers: false,
                rare_thought_probability: self.config.rare_thought_probability,
                uncommon_thought_probability: self.config.uncommon_thought_probability,
            },
            &self.templates,
            &mut rng,
        );

        // Follow-up rounds only run when there is something new to react
        // to.
        if is_follow_up && blocks.is_empty() {
            debug!(task = %task_id, "No new messages, skipping follow-up turn");
            return false;
        }

        let session_id = self
            .storage
            .get_session_binding(room_id, agent.id, backend)
            .await
            .ok()
            .flatten();

        let message = if blocks.is_empty() {
            QueryContent::Text(CONTINUE_PROMPT.to_string())
        } else {
            QueryContent::Blocks(prepare_blocks_for(backend, blocks))
        };

        let request = TurnRequest {
            task_id,
            backend,
            system_prompt: build_system_prompt(agent, backend),
            message,
            agent_id: agent.id,
            agent_name: agent.name.clone(),
            agent_group: agent.group.clone(),
            config_file: agent.persona.config_dir.clone(),
            session_id: session_id.clone(),
            has_situation_builder: shape.has_situation_builder,
            conversation_started: Some(
                chrono::Local::now().format("%Y-%m-%d (%a) %H:%M").to_string(),
            ),
        };

        let mut result = self.consume_stream(request.clone()).await;

        // Session recovery: the stored thread is gone. Rebuild with the
        // full room history, clear the session, and retry exactly once.
        if let Some((aborted_temp_id, old_thread_id)) = result.recovery.take() {
            info!(
                task = %task_id,
                old_thread_id,
                "Session recovery: replaying full history under a fresh thread"
            );
            // Close the aborted attempt's stream for the UI; the retry
            // runs under a fresh temp id.
            self.manager
                .broadcaster()
                .broadcast(room_id, &RoomEvent::StreamEnd {
                    temp_id: aborted_temp_id,
                    agent_id: agent.id,
                    response_text: None,
                    thinking_text: String::new(),
                    session_id: None,
                    memory_entries: Vec::new(),
                    policy_check_calls: Vec::new(),
                    skipped: true,
                })
                .await;
            match self.recovery_request(&request, &room, agent, &agent_names, backend).await {
                Some(recovery_request) => result = self.consume_stream(recovery_request).await,
                None => return false,
            }
        }

        let Some(outcome) = result.outcome else {
            debug!(task = %task_id, "Turn ended without a terminal event");
            return false;
        };

        // Bind the new session id only after a successful stream.
        if let Some(new_session) = &outcome.session_id {
            if Some(new_session.as_str()) != session_id.as_deref() {
                if let Err(e) = self
                    .storage
                    .set_session_binding(room_id, agent.id, backend, new_session)
                    .await
                {
                    warn!(task = %task_id, error = %e, "Session binding update failed");
                }
            }
        }

        if !outcome.memory_entries.is_empty() {
            // Entries were written by the memorize tool itself; log only.
            info!(
                task = %task_id,
                count = outcome.memory_entries.len(),
                "Agent recorded memories"
            );
        }
        if !outcome.policy_check_calls.is_empty() {
            info!(
                task = %task_id,
                calls = ?outcome.policy_check_calls,
                "Agent ran policy checks"
            );
        }

        if outcome.is_error {
            // System failure: surface the error text to the UI, persist
            // nothing.
            self.broadcast_end(room_id, agent.id, &outcome, false).await;
            return false;
        }

        if outcome.skipped || outcome.response_text.is_none() {
            info!(task = %task_id, "Agent skipped");
            self.broadcast_end(room_id, agent.id, &outcome, true).await;
            return false;
        }

        if self.was_interrupted(room_id, started).await {
            info!(task = %task_id, "Discarding response pre-empted by a user message");
            self.broadcast_end(room_id, agent.id, &outcome, true).await;
            return false;
        }

        match self.storage.get_room(room_id).await {
            Ok(room) if room.is_paused => {
                info!(task = %task_id, "Discarding response, room was paused");
                self.broadcast_end(room_id, agent.id, &outcome, true).await;
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(task = %task_id, error = %e, "Room re-check failed");
                self.broadcast_end(room_id, agent.id, &outcome, true).await;
                return false;
            }
        }

        let response_text = outcome.response_text.clone().unwrap_or_default();
        let saved = self
            .storage
            .save_message(room_id, NewMessage {
                role: Some(crate::domain::MessageRole::Assistant),
                content: response_text,
                images: Vec::new(),
                thinking: if outcome.thinking_text.is_empty() {
                    None
                } else {
                    Some(outcome.thinking_text.clone())
                },
                policy_check_calls: outcome.policy_check_calls.clone(),
                participant: Some(ParticipantKind::Character),
                participant_name: Some(agent.name.clone()),
                agent_id: Some(agent.id),
            })
            .await;

        let saved = match saved {
            Ok(saved) => saved,
            Err(e) => {
                warn!(task = %task_id, error = %e, "Message save failed");
                self.broadcast_end(room_id, agent.id, &outcome, true).await;
                return false;
            }
        };

        // new_message strictly after commit, then the real stream_end.
        self.manager
            .broadcaster()
            .broadcast(room_id, &RoomEvent::NewMessage { message: saved })
            .await;
        self.broadcast_end(room_id, agent.id, &outcome, false).await;

        true
    }

    async fn agent_name_map(
        &self,
        room: &Room,
    ) -> Result<HashMap<AgentId, String>, crate::storage::StorageError> {
        let agents = self.storage.get_room_agents(room.id).await?;
        Ok(agents.into_iter().map(|a| (a.id, a.name)).collect())
    }

    /// Build the retry request for session recovery: full room history, no
    /// after-my-last-message filter, cleared session id.
    async fn recovery_request(
        &self,
        request: &TurnRequest,
        room: &Room,
        agent: &Agent,
        agent_names: &HashMap<AgentId, String>,
        backend: BackendKind,
    ) -> Option<TurnRequest> {
        let all_messages = match self.storage.get_all_messages(room.id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(room = %room.id, error = %e, "Full history fetch failed");
                return None;
            }
        };

        let shape = detect_conversation_type(
            &all_messages,
            room.agent_ids.len(),
            &self.templates.default_user_name,
        );
        let mut rng = self.turn_rng();
        let blocks = build_conversation_context(
            &ContextParams {
                messages: &all_messages,
                limit: all_messages.len().max(1),
                agent_id: None,
                agent_name: Some(&agent.name),
                user_name: shape.user_name.as_deref(),
                agent_names,
                backend,
                include_response_instruction: true,
                include_skip_markers: self.config.include_skipped_in_recovery,
                rare_thought_probability: self.config.rare_thought_probability,
                uncommon_thought_probability: self.config.uncommon_thought_probability,
            },
            &self.templates,
            &mut rng,
        );

        let message = if blocks.is_empty() {
            QueryContent::Text(CONTINUE_PROMPT.to_string())
        } else {
            QueryContent::Blocks(prepare_blocks_for(backend, blocks))
        };

        Some(TurnRequest {
            message,
            session_id: None,
            ..request.clone()
        })
    }

    /// Consume one turn stream into its terminal state.
    async fn consume_stream(&self, request: TurnRequest) -> StreamResult {
        let stream = self.manager.generate_response(request);
        tokio::pin!(stream);

        let mut result = StreamResult::default();
        while let Some(event) = stream.next().await {
            match event {
                TurnEvent::StreamStart { .. }
                | TurnEvent::ContentDelta { .. }
                | TurnEvent::ThinkingDelta { .. } => {}
                TurnEvent::SessionRecovery { temp_id, old_thread_id } => {
                    result.recovery = Some((temp_id, old_thread_id));
                }
                TurnEvent::StreamEnd(outcome) => {
                    result.outcome = Some(outcome);
                }
            }
        }
        result
    }

    /// Broadcast the terminal event after the persist decision. A
    /// discarded turn reports `skipped: true` and carries no content.
    async fn broadcast_end(
        &self,
        room_id: RoomId,
        agent_id: AgentId,
        outcome: &TurnOutcome,
        discarded: bool,
    ) {
        let event = if discarded {
            RoomEvent::StreamEnd {
                temp_id: outcome.temp_id.clone(),
                agent_id,
                response_text: None,
                thinking_text: String::new(),
                session_id: outcome.session_id.clone(),
                memory_entries: Vec::new(),
                policy_check_calls: Vec::new(),
                skipped: true,
            }
        } else {
            RoomEvent::StreamEnd {
                temp_id: outcome.temp_id.clone(),
                agent_id,
                response_text: outcome.response_text.clone(),
                thinking_text: outcome.thinking_text.clone(),
                session_id: outcome.session_id.clone(),
                memory_entries: outcome.memory_entries.clone(),
                policy_check_calls: outcome.policy_check_calls.clone(),
                skipped: outcome.skipped,
            }
        };
        self.manager.broadcaster().broadcast(room_id, &event).await;
    }
}
