//! Round execution for chat rooms.
//!
//! A round is one traversal of a turn tape. Cells run strictly in order;
//! inside an interrupt cell the agents run concurrently, because only
//! sequential reasoning must see each prior utterance. A fresh user
//! message pre-empts the round: in-flight turns are interrupted and
//! unstarted cells never run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use roundtable_core::config::OrchestratorConfig;

use crate::domain::{Agent, AgentId, Message, NewMessage, RoomId};
use crate::manager::AgentManager;
use crate::sse::RoomEvent;
use crate::storage::{Storage, StorageError};

use super::response::ResponseGenerator;
use super::tape::{TapeGenerator, TurnCell, TurnTape};

/// Drives rounds for rooms and owns the interruption stamps.
pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    manager: Arc<AgentManager>,
    response_generator: Arc<ResponseGenerator>,
    last_user_message_time: Arc<Mutex<HashMap<RoomId, Instant>>>,
    config: OrchestratorConfig,
    /// Pinned tape-shuffle seed for tests; entropy otherwise.
    rng_seed: Option<u64>,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        manager: Arc<AgentManager>,
        response_generator: Arc<ResponseGenerator>,
        last_user_message_time: Arc<Mutex<HashMap<RoomId, Instant>>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            storage,
            manager,
            response_generator,
            last_user_message_time,
            config,
            rng_seed: None,
        }
    }

    /// Pin the tape-shuffle RNG (tests).
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    fn round_rng(&self) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::thread_rng().next_u64()),
        }
    }

    /// Stamp the interruption clock for a room. Turns and cells started
    /// before this stamp are pre-empted.
    pub async fn stamp_user_message(&self, room_id: RoomId) {
        self.last_user_message_time
            .lock()
            .await
            .insert(room_id, Instant::now());
    }

    /// Ingest a user message: persist it, stamp the interruption clock,
    /// interrupt live turns, broadcast, then run a fresh initial round.
    pub async fn handle_user_message(
        &self,
        room_id: RoomId,
        message: NewMessage,
    ) -> Result<Message, StorageError> {
        let saved = self.storage.save_message(room_id, message).await?;
        self.stamp_user_message(room_id).await;
        self.storage.touch_room_activity(room_id, true).await?;

        self.manager.interrupt_room(room_id).await;
        self.manager
            .broadcaster()
            .broadcast(room_id, &RoomEvent::NewMessage { message: saved.clone() })
            .await;

        let agents = self.storage.get_room_agents(room_id).await?;
        let mentioned = extract_mention(&saved.content, &agents);
        self.run_initial_round(room_id, mentioned).await?;

        Ok(saved)
    }

    /// Run the round right after a user message. Returns whether any agent
    /// spoke.
    pub async fn run_initial_round(
        &self,
        room_id: RoomId,
        mentioned: Option<AgentId>,
    ) -> Result<bool, StorageError> {
        let Some((speakers, interrupters)) = self.round_participants(room_id).await? else {
            return Ok(false);
        };

        let generator = TapeGenerator::new(speakers.clone(), interrupters.clone(), mentioned);
        let tape = generator.initial_round(&mut self.round_rng());
        let agents = agent_index(speakers, interrupters);

        let spoke = self.execute_tape(room_id, &tape, &agents, false).await;
        if !spoke && !tape.is_empty() {
            info!(room = %room_id, "Every agent skipped the round, marking room finished");
            self.storage.mark_room_finished(room_id).await?;
        }
        Ok(spoke)
    }

    /// Run an orchestrator-initiated follow-up round, honoring the room's
    /// follow-up ceiling. Returns whether any agent spoke.
    pub async fn run_follow_up_round(&self, room_id: RoomId) -> Result<bool, StorageError> {
        let room = self.storage.get_room(room_id).await?;
        if room.follow_up_rounds_done >= room.max_follow_up_rounds {
            debug!(room = %room_id, "Follow-up ceiling reached");
            return Ok(false);
        }

        let Some((speakers, interrupters)) = self.round_participants(room_id).await? else {
            return Ok(false);
        };

        let generator = TapeGenerator::new(speakers.clone(), interrupters.clone(), None);
        let tape = generator.follow_up_round(&mut self.round_rng());
        let agents = agent_index(speakers, interrupters);

        let spoke = self.execute_tape(room_id, &tape, &agents, true).await;
        self.storage.increment_follow_up_rounds(room_id).await?;

        if !spoke && !tape.is_empty() {
            info!(room = %room_id, "Follow-up round fully skipped, marking room finished");
            self.storage.mark_room_finished(room_id).await?;
        }
        Ok(spoke)
    }

    /// Room members split into speakers and interrupt agents; `None` when
    /// the room cannot run a round.
    async fn round_participants(
        &self,
        room_id: RoomId,
    ) -> Result<Option<(Vec<Agent>, Vec<Agent>)>, StorageError> {
        let room = self.storage.get_room(room_id).await?;
        if room.is_paused || room.is_finished {
            debug!(room = %room_id, paused = room.is_paused, "Room not accepting rounds");
            return Ok(None);
        }

        let members = self.storage.get_room_agents(room_id).await?;
        if members.is_empty() {
            info!(room = %room_id, "Room has no agents, marking finished");
            self.storage.mark_room_finished(room_id).await?;
            return Ok(None);
        }

        let (interrupters, speakers): (Vec<Agent>, Vec<Agent>) =
            members.into_iter().partition(|a| a.interrupt_every_turn);
        Ok(Some((speakers, interrupters)))
    }

    async fn round_preempted(&self, room_id: RoomId, round_started: Instant) -> bool {
        self.last_user_message_time
            .lock()
            .await
            .get(&room_id)
            .is_some_and(|stamp| *stamp > round_started)
    }

    /// Execute a tape cell by cell. Returns whether any agent spoke.
    ///
    /// A user message arriving after the round started aborts the cells
    /// that have not begun; in-flight turns are handled per-agent by the
    /// response generator's own stamp check.
    async fn execute_tape(
        &self,
        room_id: RoomId,
        tape: &TurnTape,
        agents: &HashMap<AgentId, Agent>,
        is_follow_up: bool,
    ) -> bool {
        let mut spoke_any = false;
        let round_started = Instant::now();

        for cell in &tape.cells {
            if self.round_preempted(room_id, round_started).await {
                info!(room = %room_id, "Round pre-empted by a new user message");
                break;
            }
            if cell.agent_ids().is_empty() {
                continue;
            }

            match cell {
                TurnCell::Sequential { agent_ids } => {
                    for agent_id in agent_ids {
                        let Some(agent) = agents.get(agent_id) else {
                            warn!(room = %room_id, agent = %agent_id, "Unknown agent in tape");
                            continue;
                        };
                        if self
                            .response_generator
                            .generate(room_id, agent, is_follow_up)
                            .await
                        {
                            spoke_any = true;
                        }
                    }
                }
                TurnCell::Interrupt { agent_ids, triggering_agent_id } => {
                    debug!(
                        room = %room_id,
                        trigger = ?triggering_agent_id,
                        count = agent_ids.len(),
                        "Running interrupt cell"
                    );
                    // Interrupt agents may run concurrently; aborts are
                    // per-agent, not per-cell.
                    let mut turns = JoinSet::new();
                    for agent_id in agent_ids {
                        let Some(agent) = agents.get(agent_id).cloned() else {
                            warn!(room = %room_id, agent = %agent_id, "Unknown agent in tape");
                            continue;
                        };
                        let generator = Arc::clone(&self.response_generator);
                        turns.spawn(async move {
                            generator.generate(room_id, &agent, true).await
                        });
                    }
                    while let Some(result) = turns.join_next().await {
                        if matches!(result, Ok(true)) {
                            spoke_any = true;
                        }
                    }
                }
            }
        }

        spoke_any
    }
}

fn agent_index(speakers: Vec<Agent>, interrupters: Vec<Agent>) -> HashMap<AgentId, Agent> {
    speakers
        .into_iter()
        .chain(interrupters)
        .map(|a| (a.id, a))
        .collect()
}

/// Find an `@name` mention against the room's member names. The earliest
/// mention in the message wins.
pub fn extract_mention(content: &str, agents: &[Agent]) -> Option<AgentId> {
    agents
        .iter()
        .filter_map(|agent| {
            content
                .find(&format!("@{}", agent.name))
                .map(|pos| (pos, agent.id))
        })
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, id)| id)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::PersonaConfig;

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

    #[test]
    fn mention_matches_member_name() {
        let agents = vec![agent(1, "Ada"), agent(2, "Grace")];
        assert_eq!(extract_mention("@Grace hi", &agents), Some(AgentId(2)));
        assert_eq!(extract_mention("hello @Ada", &agents), Some(AgentId(1)));
        assert_eq!(extract_mention("no mention here", &agents), None);
    }

    #[test]
    fn earliest_mention_wins() {
        let agents = vec![agent(1, "Ada"), agent(2, "Grace")];
        assert_eq!(extract_mention("@Grace then @Ada", &agents), Some(AgentId(2)));
    }

    #[test]
    fn mention_of_non_member_is_ignored() {
        let agents = vec![agent(1, "Ada")];
        assert_eq!(extract_mention("@Bob hi", &agents), None);
    }
}
