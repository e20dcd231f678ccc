//! Conversation orchestration: tapes, context, rounds, scheduling.

pub mod context;
pub mod orchestrator;
pub mod response;
pub mod scheduler;
pub mod tape;

pub use context::{ContextTemplates, build_conversation_context, detect_conversation_type};
pub use orchestrator::{Orchestrator, extract_mention};
pub use response::{ResponseGenerator, build_system_prompt};
pub use scheduler::FollowUpScheduler;
pub use tape::{TapeGenerator, TurnCell, TurnTape};
