//! Conversation context building for multi-agent awareness.
//!
//! Each turn gets the messages since the agent's own last utterance,
//! rendered as `{speaker}:\n{content}` text with inline image blocks kept
//! in position, followed by template sections and the response
//! instruction. Skip markers and system notifications are invisible.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::domain::{AgentId, BackendKind, Message, MessageRole, ParticipantKind};
use crate::providers::ContentBlock;

/// Template sections around the rendered conversation. Loaded from the
/// prompt provider in production; defaults cover tests and bare setups.
#[derive(Debug, Clone)]
pub struct ContextTemplates {
    pub header: String,
    pub footer: String,
    pub recall_reminder: String,
    /// `{agent_name}` / `{user_name}` placeholders are substituted.
    pub response_instruction: String,
    /// Backend-B variant; falls back to `response_instruction` when empty.
    pub response_instruction_beta: String,
    /// Display name when a user message has no participant name.
    pub default_user_name: String,
}

impl Default for ContextTemplates {
    fn default() -> Self {
        Self {
            header: "Here's the conversation so far:".to_string(),
            footer: String::new(),
            recall_reminder:
                "If a topic sounds familiar, check your long-term memory with the recall tool."
                    .to_string(),
            response_instruction:
                "Respond naturally as {agent_name}. Keep the conversation with {user_name} alive, or call the skip tool if {agent_name} would stay quiet."
                    .to_string(),
            response_instruction_beta: String::new(),
            default_user_name: "User".to_string(),
        }
    }
}

/// Result of scanning messages for conversation shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationShape {
    pub is_one_on_one: bool,
    pub user_name: Option<String>,
    pub has_situation_builder: bool,
}

/// Detect conversation type and participants.
///
/// 1-on-1 requires exactly one agent, at least one user/character message,
/// and no situation-builder message. The display name comes from the first
/// character or user message found.
pub fn detect_conversation_type(
    messages: &[Message],
    agent_count: usize,
    default_user_name: &str,
) -> ConversationShape {
    let mut user_name = None;
    let mut has_user_or_character = false;
    let mut has_situation_builder = false;

    for msg in messages {
        if msg.role != MessageRole::User {
            continue;
        }
        match msg.participant {
            ParticipantKind::SituationBuilder => has_situation_builder = true,
            ParticipantKind::Character => {
                if let Some(name) = &msg.participant_name {
                    has_user_or_character = true;
                    if user_name.is_none() {
                        user_name = Some(name.clone());
                    }
                }
            }
            ParticipantKind::User => {
                has_user_or_character = true;
                if user_name.is_none() {
                    user_name = Some(default_user_name.to_string());
                }
            }
            ParticipantKind::System => {}
        }
    }

    ConversationShape {
        is_one_on_one: agent_count == 1 && has_user_or_character && !has_situation_builder,
        user_name,
        has_situation_builder,
    }
}

/// Parameters for one context build.
pub struct ContextParams<'a> {
    pub messages: &'a [Message],
    /// Window when the agent has not spoken yet.
    pub limit: usize,
    /// When set, only messages after this agent's last response are used.
    pub agent_id: Option<AgentId>,
    pub agent_name: Option<&'a str>,
    pub user_name: Option<&'a str>,
    /// Agent id to display-name lookup for speaker labels.
    pub agent_names: &'a HashMap<AgentId, String>,
    pub backend: BackendKind,
    pub include_response_instruction: bool,
    /// Render persisted skip markers too (session-recovery replay toggle).
    pub include_skip_markers: bool,
    pub rare_thought_probability: f64,
    pub uncommon_thought_probability: f64,
}

/// Build content blocks from recent room messages.
///
/// Returns an empty list when there is nothing new for the agent to see,
/// so follow-up rounds can tell "no new messages" from "empty template".
pub fn build_conversation_context(
    params: &ContextParams<'_>,
    templates: &ContextTemplates,
    rng: &mut StdRng,
) -> Vec<ContentBlock> {
    if params.messages.is_empty() {
        return Vec::new();
    }

    let recent: &[Message] = match params.agent_id {
        Some(agent_id) => {
            let last_idx = params
                .messages
                .iter()
                .rposition(|m| m.agent_id == Some(agent_id));
            match last_idx {
                Some(idx) => &params.messages[idx + 1..],
                None => {
                    let start = params.messages.len().saturating_sub(params.limit);
                    &params.messages[start..]
                }
            }
        }
        None => {
            let start = params.messages.len().saturating_sub(params.limit);
            &params.messages[start..]
        }
    };
    if recent.is_empty() {
        return Vec::new();
    }

    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut current_text = format!("{}\n", templates.header);
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut rendered = 0usize;

    for msg in recent {
        // Skip markers are the agent's private choice; system rows are
        // UI-only notifications.
        if msg.is_skip_marker() && !params.include_skip_markers {
            continue;
        }
        if msg.participant == ParticipantKind::System {
            continue;
        }

        let speaker = speaker_label(msg, params.agent_names, &templates.default_user_name);

        // Duplicate (speaker, content) pairs render once.
        if !seen.insert((speaker.clone(), msg.content.clone())) {
            continue;
        }
        rendered += 1;

        if msg.images.is_empty() {
            current_text.push_str(&format!("{speaker}:\n{}\n\n", msg.content));
        } else {
            // Split the text so the images land at their position in the
            // conversation.
            current_text.push_str(&format!("{speaker}:\n"));
            if !current_text.trim().is_empty() {
                blocks.push(ContentBlock::Text { text: std::mem::take(&mut current_text) });
            }
            for image in &msg.images {
                blocks.push(ContentBlock::Image { source: image.clone() });
            }
            current_text = if msg.content.is_empty() {
                "\n".to_string()
            } else {
                format!("{}\n\n", msg.content)
            };
        }
    }

    if rendered == 0 {
        return Vec::new();
    }

    if !templates.footer.is_empty() {
        current_text.push_str(&format!("{}\n", templates.footer));
    }

    if params.include_response_instruction {
        if !templates.recall_reminder.is_empty() {
            current_text.push_str(&format!("\n{}\n", templates.recall_reminder));
        }

        if let Some(agent_name) = params.agent_name {
            let roll: f64 = rng.r#gen();
            if roll < params.rare_thought_probability {
                debug!(agent_name, roll, "Rare thought triggered");
                current_text.push_str(&format!(
                    "<special_instruction>For this response only: Generate a thought {agent_name} would have less than 5% of the time.</special_instruction>\n"
                ));
            } else if roll < params.uncommon_thought_probability {
                debug!(agent_name, roll, "Uncommon thought triggered");
                current_text.push_str(&format!(
                    "<special_instruction>For this response only: Generate a thought {agent_name} would have less than 20% of the time.</special_instruction>\n"
                ));
            }

            let instruction = match params.backend {
                BackendKind::Beta if !templates.response_instruction_beta.is_empty() => {
                    &templates.response_instruction_beta
                }
                _ => &templates.response_instruction,
            };
            let user_name = params.user_name.unwrap_or(&templates.default_user_name);
            current_text.push_str(
                &instruction
                    .replace("{agent_name}", agent_name)
                    .replace("{user_name}", user_name),
            );
        }
    }

    let trimmed = current_text.trim();
    if !trimmed.is_empty() {
        blocks.push(ContentBlock::Text { text: trimmed.to_string() });
    }

    blocks
}

fn speaker_label(
    msg: &Message,
    agent_names: &HashMap<AgentId, String>,
    default_user_name: &str,
) -> String {
    if msg.role == MessageRole::User {
        if let Some(name) = &msg.participant_name {
            return name.clone();
        }
        if msg.participant == ParticipantKind::SituationBuilder {
            return "Situation Builder".to_string();
        }
        return default_user_name.to_string();
    }
    match msg.agent_id {
        Some(agent_id) => agent_names
            .get(&agent_id)
            .cloned()
            .unwrap_or_else(|| format!("Agent {agent_id}")),
        None => "Unknown".to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::{InlineImage, RoomId, SKIP_MESSAGE_TEXT};
    use rand::SeedableRng;

    fn msg(id: i64, role: MessageRole, participant: ParticipantKind, content: &str) -> Message {
        Message {
            id,
            room_id: RoomId(1),
            role,
            content: content.to_string(),
            images: Vec::new(),
            thinking: None,
            policy_check_calls: Vec::new(),
            participant,
            participant_name: None,
            agent_id: None,
            created_at: id,
        }
    }

    fn agent_msg(id: i64, agent_id: i64, content: &str) -> Message {
        Message {
            agent_id: Some(AgentId(agent_id)),
            participant: ParticipantKind::Character,
            ..msg(id, MessageRole::Assistant, ParticipantKind::Character, content)
        }
    }

    fn user_msg(id: i64, content: &str) -> Message {
        msg(id, MessageRole::User, ParticipantKind::User, content)
    }

    fn names() -> HashMap<AgentId, String> {
        HashMap::from([(AgentId(1), "Ada".to_string()), (AgentId(2), "Grace".to_string())])
    }

    fn params<'a>(
        messages: &'a [Message],
        agent_id: Option<AgentId>,
        agent_names: &'a HashMap<AgentId, String>,
    ) -> ContextParams<'a> {
        ContextParams {
            messages,
            limit: 25,
            agent_id,
            agent_name: Some("Ada"),
            user_name: Some("Sam"),
            agent_names,
            backend: BackendKind::Alpha,
            include_response_instruction: true,
            include_skip_markers: false,
            // Pinned off so tests are deterministic without seeding tricks.
            rare_thought_probability: 0.0,
            uncommon_thought_probability: 0.0,
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1)
    }

    #[test]
    fn renders_speakers_and_instruction() {
        let messages = vec![user_msg(1, "hi"), agent_msg(2, 2, "hello")];
        let names = names();
        let blocks =
            build_conversation_context(&params(&messages, None, &names), &ContextTemplates::default(), &mut rng());

        assert_eq!(blocks.len(), 1);
        let ContentBlock::Text { text } = &blocks[0] else {
            panic!("expected text block");
        };
        assert!(text.contains("User:\nhi"));
        assert!(text.contains("Grace:\nhello"));
        assert!(text.contains("Respond naturally as Ada"));
        assert!(text.contains("with Sam"));
    }

    #[test]
    fn only_messages_after_agents_last_response() {
        let messages = vec![
            user_msg(1, "first"),
            agent_msg(2, 1, "my answer"),
            user_msg(3, "second"),
        ];
        let names = names();
        let blocks = build_conversation_context(
            &params(&messages, Some(AgentId(1)), &names),
            &ContextTemplates::default(),
            &mut rng(),
        );

        let ContentBlock::Text { text } = &blocks[0] else {
            panic!("expected text block");
        };
        assert!(text.contains("second"));
        assert!(!text.contains("first"));
        assert!(!text.contains("my answer"));
    }

    #[test]
    fn skip_markers_and_system_rows_are_invisible() {
        let messages = vec![
            agent_msg(1, 2, SKIP_MESSAGE_TEXT),
            msg(2, MessageRole::User, ParticipantKind::System, "Ada joined the chat"),
        ];
        let names = names();
        let blocks =
            build_conversation_context(&params(&messages, None, &names), &ContextTemplates::default(), &mut rng());
        assert!(blocks.is_empty(), "nothing visible means no context at all");
    }

    #[test]
    fn duplicate_messages_render_once() {
        let messages = vec![user_msg(1, "echo"), user_msg(2, "echo")];
        let names = names();
        let blocks =
            build_conversation_context(&params(&messages, None, &names), &ContextTemplates::default(), &mut rng());
        let ContentBlock::Text { text } = &blocks[0] else {
            panic!("expected text block");
        };
        assert_eq!(text.matches("echo").count(), 1);
    }

    #[test]
    fn images_split_the_text_in_position() {
        let mut with_image = user_msg(2, "look at this");
        with_image.images.push(InlineImage {
            data: "aGk=".to_string(),
            media_type: "image/webp".to_string(),
        });
        let messages = vec![user_msg(1, "before"), with_image, user_msg(3, "after")];
        let names = names();
        let blocks =
            build_conversation_context(&params(&messages, None, &names), &ContextTemplates::default(), &mut rng());

        assert_eq!(blocks.len(), 3);
        assert!(matches!(&blocks[0], ContentBlock::Text { text } if text.contains("before")));
        assert!(matches!(&blocks[1], ContentBlock::Image { .. }));
        assert!(matches!(&blocks[2], ContentBlock::Text { text } if text.contains("after")));
    }

    #[test]
    fn one_on_one_requires_single_agent_and_no_situation_builder() {
        let plain = vec![user_msg(1, "hi")];
        let shape = detect_conversation_type(&plain, 1, "User");
        assert!(shape.is_one_on_one);
        assert_eq!(shape.user_name.as_deref(), Some("User"));

        let shape = detect_conversation_type(&plain, 2, "User");
        assert!(!shape.is_one_on_one);

        let with_builder = vec![
            user_msg(1, "hi"),
            msg(2, MessageRole::User, ParticipantKind::SituationBuilder, "A dark cave."),
        ];
        let shape = detect_conversation_type(&with_builder, 1, "User");
        assert!(!shape.is_one_on_one);
        assert!(shape.has_situation_builder);
    }

    #[test]
    fn character_name_wins_over_default() {
        let mut character = user_msg(1, "hi");
        character.participant = ParticipantKind::Character;
        character.participant_name = Some("Sam".to_string());
        let shape = detect_conversation_type(&[character], 1, "User");
        assert_eq!(shape.user_name.as_deref(), Some("Sam"));
    }

    #[test]
    fn rare_thought_appends_special_instruction() {
        let messages = vec![user_msg(1, "hi")];
        let names = names();
        let mut p = params(&messages, None, &names);
        p.rare_thought_probability = 1.0;
        p.uncommon_thought_probability = 1.0;
        let blocks = build_conversation_context(&p, &ContextTemplates::default(), &mut rng());
        let ContentBlock::Text { text } = &blocks[0] else {
            panic!("expected text block");
        };
        assert!(text.contains("<special_instruction>"));
        assert!(text.contains("less than 5%"));
    }
}
