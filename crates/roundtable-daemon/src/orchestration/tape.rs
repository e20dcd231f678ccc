//! Turn tape generation.
//!
//! A tape is the ordered program of "who speaks next" cells for one round,
//! computed fresh each round. Priority-positive agents speak first (higher
//! priority earlier), regular agents follow in shuffled order, negative
//! priorities close the round. Interrupt agents are woven in after every
//! non-transparent speaker, excluding the speaker itself.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::domain::{Agent, AgentId};

/// One slot in the speaking plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnCell {
    /// One agent speaks; the next cell waits for its outcome.
    Sequential { agent_ids: Vec<AgentId> },
    /// Interrupt agents react, possibly concurrently.
    Interrupt {
        agent_ids: Vec<AgentId>,
        triggering_agent_id: Option<AgentId>,
    },
}

impl TurnCell {
    pub fn agent_ids(&self) -> &[AgentId] {
        match self {
            Self::Sequential { agent_ids } | Self::Interrupt { agent_ids, .. } => agent_ids,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupt { .. })
    }
}

/// An ordered sequence of cells for one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnTape {
    pub cells: Vec<TurnCell>,
}

impl TurnTape {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// All speaker ids in tape order (interrupt cells flattened).
    pub fn speaking_order(&self) -> Vec<AgentId> {
        self.cells
            .iter()
            .flat_map(|cell| cell.agent_ids().iter().copied())
            .collect()
    }
}

/// Generates turn tapes from the room's member agents.
pub struct TapeGenerator {
    priority_agents: Vec<Agent>,
    regular_agents: Vec<Agent>,
    last_agents: Vec<Agent>,
    interrupt_agents: Vec<Agent>,
    mentioned_agent_id: Option<AgentId>,
}

impl TapeGenerator {
    /// `agents` are the room's non-interrupt members; `interrupt_agents`
    /// have `interrupt_every_turn` set. `mentioned_agent_id` comes from an
    /// `@name` token in the user message.
    pub fn new(
        agents: Vec<Agent>,
        interrupt_agents: Vec<Agent>,
        mentioned_agent_id: Option<AgentId>,
    ) -> Self {
        let mut priority_agents = Vec::new();
        let mut regular_agents = Vec::new();
        let mut last_agents = Vec::new();

        for agent in agents {
            if agent.priority > 0 {
                priority_agents.push(agent);
            } else if agent.priority < 0 {
                last_agents.push(agent);
            } else {
                regular_agents.push(agent);
            }
        }

        // Higher priority speaks earlier; more negative speaks later.
        priority_agents.sort_by_key(|a| std::cmp::Reverse(a.priority));
        last_agents.sort_by_key(|a| a.priority);

        Self {
            priority_agents,
            regular_agents,
            last_agents,
            interrupt_agents,
            mentioned_agent_id,
        }
    }

    fn interrupt_cell(
        &self,
        triggering_agent_id: Option<AgentId>,
        exclude_agent_id: Option<AgentId>,
    ) -> TurnCell {
        TurnCell::Interrupt {
            agent_ids: self
                .interrupt_agents
                .iter()
                .map(|a| a.id)
                .filter(|id| Some(*id) != exclude_agent_id)
                .collect(),
            triggering_agent_id,
        }
    }

    fn push_speaker(&self, tape: &mut TurnTape, agent: &Agent) {
        tape.cells.push(TurnCell::Sequential { agent_ids: vec![agent.id] });
        if !self.interrupt_agents.is_empty() && !agent.transparent {
            tape.cells
                .push(self.interrupt_cell(Some(agent.id), Some(agent.id)));
        }
    }

    /// Tape for the round right after a user message.
    ///
    /// Interrupt agents react to the user first; a mentioned agent speaks
    /// before everyone else; then priority, shuffled regular, and last
    /// agents, each followed by an interrupt cell when non-transparent.
    pub fn initial_round(&self, rng: &mut StdRng) -> TurnTape {
        let mut tape = TurnTape::default();

        if !self.interrupt_agents.is_empty() {
            tape.cells.push(TurnCell::Interrupt {
                agent_ids: self.interrupt_agents.iter().map(|a| a.id).collect(),
                // Triggered by the user.
                triggering_agent_id: None,
            });
        }

        let mentioned = self.mentioned_agent_id.and_then(|id| {
            self.priority_agents
                .iter()
                .chain(&self.regular_agents)
                .chain(&self.last_agents)
                .find(|a| a.id == id)
        });
        if let Some(agent) = mentioned {
            tape.cells.push(TurnCell::Sequential { agent_ids: vec![agent.id] });
            if !self.interrupt_agents.is_empty() && !agent.transparent {
                tape.cells
                    .push(self.interrupt_cell(Some(agent.id), Some(agent.id)));
            }
        }

        let mentioned_id = mentioned.map(|a| a.id);
        let skip_mentioned = move |agent: &&Agent| Some(agent.id) != mentioned_id;

        for agent in self.priority_agents.iter().filter(skip_mentioned) {
            self.push_speaker(&mut tape, agent);
        }

        let mut shuffled: Vec<&Agent> = self.regular_agents.iter().filter(skip_mentioned).collect();
        shuffled.shuffle(rng);
        for agent in shuffled {
            self.push_speaker(&mut tape, agent);
        }

        for agent in self.last_agents.iter().filter(skip_mentioned) {
            self.push_speaker(&mut tape, agent);
        }

        tape
    }

    /// Tape for an orchestrator-initiated follow-up round: same composition
    /// without the leading user-interrupt cell and mention special-casing.
    pub fn follow_up_round(&self, rng: &mut StdRng) -> TurnTape {
        let mut tape = TurnTape::default();

        let mut shuffled: Vec<&Agent> = self.regular_agents.iter().collect();
        shuffled.shuffle(rng);

        let ordered = self
            .priority_agents
            .iter()
            .chain(shuffled)
            .chain(&self.last_agents);
        for agent in ordered {
            self.push_speaker(&mut tape, agent);
        }

        tape
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::PersonaConfig;
    use rand::SeedableRng;

    fn agent(id: i64, priority: i32, transparent: bool) -> Agent {
        Agent {
            id: AgentId(id),
            name: format!("agent-{id}"),
            priority,
            transparent,
            interrupt_every_turn: false,
            group: "default".to_string(),
            persona: PersonaConfig::default(),
        }
    }

    fn interrupt_agent(id: i64) -> Agent {
        Agent {
            interrupt_every_turn: true,
            ..agent(id, 0, false)
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn empty_room_yields_empty_tape() {
        let generator = TapeGenerator::new(Vec::new(), Vec::new(), None);
        assert!(generator.initial_round(&mut rng()).is_empty());
        assert!(generator.follow_up_round(&mut rng()).is_empty());
    }

    #[test]
    fn priority_before_regular_before_last() {
        let agents = vec![
            agent(1, -2, false),
            agent(2, 0, false),
            agent(3, 5, false),
            agent(4, 3, false),
            agent(5, -1, false),
        ];
        let generator = TapeGenerator::new(agents, Vec::new(), None);
        let order = generator.initial_round(&mut rng()).speaking_order();

        // Priority descending first, then the regular agent, then last
        // agents ascending (more negative later).
        assert_eq!(order[0], AgentId(3));
        assert_eq!(order[1], AgentId(4));
        assert_eq!(order[2], AgentId(2));
        assert_eq!(order[3], AgentId(1));
        assert_eq!(order[4], AgentId(5));
    }

    #[test]
    fn interrupt_cell_leads_initial_round() {
        let generator = TapeGenerator::new(vec![agent(1, 0, false)], vec![interrupt_agent(9)], None);
        let tape = generator.initial_round(&mut rng());

        assert_eq!(
            tape.cells[0],
            TurnCell::Interrupt {
                agent_ids: vec![AgentId(9)],
                triggering_agent_id: None,
            }
        );
    }

    #[test]
    fn follow_up_round_has_no_leading_interrupt() {
        let generator = TapeGenerator::new(vec![agent(1, 0, false)], vec![interrupt_agent(9)], None);
        let tape = generator.follow_up_round(&mut rng());

        assert_eq!(tape.cells[0], TurnCell::Sequential { agent_ids: vec![AgentId(1)] });
        assert!(tape.cells[1].is_interrupt());
    }

    #[test]
    fn transparent_speaker_triggers_no_interrupt() {
        let generator = TapeGenerator::new(vec![agent(1, 0, true)], vec![interrupt_agent(9)], None);
        let tape = generator.follow_up_round(&mut rng());
        assert_eq!(tape.cells.len(), 1);
    }

    #[test]
    fn no_self_interruption() {
        // An interrupt agent also listed as a speaker never appears in its
        // own trailing interrupt cell.
        let speaker = agent(9, 0, false);
        let generator = TapeGenerator::new(vec![speaker], vec![interrupt_agent(9), interrupt_agent(5)], None);
        let tape = generator.follow_up_round(&mut rng());

        for cell in &tape.cells {
            if let TurnCell::Interrupt { agent_ids, triggering_agent_id: Some(trigger) } = cell {
                assert!(!agent_ids.contains(trigger), "self-interruption in {cell:?}");
            }
        }
    }

    #[test]
    fn mentioned_agent_speaks_first_after_interrupts() {
        let agents = vec![agent(1, 5, false), agent(2, 0, false), agent(3, 0, false)];
        let generator = TapeGenerator::new(agents, vec![interrupt_agent(9)], Some(AgentId(3)));
        let tape = generator.initial_round(&mut rng());

        // Cell 0 is the user-triggered interrupt; cell 1 the mention.
        assert_eq!(tape.cells[1], TurnCell::Sequential { agent_ids: vec![AgentId(3)] });
        // Its trailing interrupt cell is attributed to the mentioned agent.
        assert_eq!(
            tape.cells[2],
            TurnCell::Interrupt {
                agent_ids: vec![AgentId(9)],
                triggering_agent_id: Some(AgentId(3)),
            }
        );

        // The mentioned agent appears exactly once as a speaker.
        let speakers: Vec<AgentId> = tape
            .cells
            .iter()
            .filter(|c| !c.is_interrupt())
            .flat_map(|c| c.agent_ids().iter().copied())
            .collect();
        assert_eq!(speakers.iter().filter(|id| **id == AgentId(3)).count(), 1);
        // And no later than any other speaker.
        assert_eq!(speakers[0], AgentId(3));
    }

    #[test]
    fn shuffle_is_deterministic_under_a_seed() {
        let agents: Vec<Agent> = (1..=6).map(|id| agent(id, 0, false)).collect();
        let generator = TapeGenerator::new(agents, Vec::new(), None);

        let a = generator.initial_round(&mut StdRng::seed_from_u64(7));
        let b = generator.initial_round(&mut StdRng::seed_from_u64(7));
        let c = generator.initial_round(&mut StdRng::seed_from_u64(8));
        assert_eq!(a, b);
        assert_ne!(a, c, "different seeds should shuffle differently");
    }
}
