//! Backend provider abstraction.
//!
//! Two backend families drive agent turns: backend-A (`alpha`), a long-lived
//! per-task agent client, and backend-B (`beta`), a pooled app-server
//! subprocess speaking JSON-RPC. The orchestration layer only sees the
//! [`Provider`] / [`BackendClient`] / [`StreamParser`] seams; nothing above
//! this module branches on the backend except prompt selection and image
//! format.

pub mod alpha;
pub mod beta;
pub mod hooks;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use roundtable_core::stream::{ParsedStreamMessage, alpha::AlphaMessage, beta::BetaEvent};

use crate::domain::{AgentId, BackendKind, InlineImage, RoomId, TaskId};

pub use hooks::{HookCaptures, HookSignal};

/// Errors from backend clients and transports.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The stored thread id is unknown to the backend; the caller must
    /// replay full history under a fresh thread.
    #[error("Session recovery required (lost thread {old_thread_id})")]
    SessionRecovery { old_thread_id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Errors worth a connect retry with backoff.
    pub fn is_transient_transport(&self) -> bool {
        match self {
            Self::Transport(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("transport not ready") || msg.contains("transport")
            }
            _ => false,
        }
    }
}

/// A content block handed to `query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text { text: String },
    Image { source: InlineImage },
}

/// Message content for a turn: plain text or an ordered block list with
/// inline images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl QueryContent {
    /// Flatten to plain text, dropping image blocks.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        ContentBlock::Image { .. } => None,
                    })
                    .collect();
                parts.join("\n")
            }
        }
    }

    pub fn has_images(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Blocks(blocks) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::Image { .. })),
        }
    }

    pub fn text_len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::Image { .. } => 0,
                })
                .sum(),
        }
    }
}

/// Environment handed to tool-server subprocesses launched by either
/// backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolServerEnv {
    pub agent_name: String,
    pub agent_id: AgentId,
    pub agent_group: String,
    pub config_file: Option<String>,
    pub room_id: RoomId,
    pub backend: String,
    pub has_situation_builder: bool,
}

impl ToolServerEnv {
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("AGENT_NAME".to_string(), self.agent_name.clone()),
            ("AGENT_ID".to_string(), self.agent_id.to_string()),
            ("AGENT_GROUP".to_string(), self.agent_group.clone()),
            ("ROOM_ID".to_string(), self.room_id.to_string()),
            ("PROVIDER".to_string(), self.backend.clone()),
            (
                "HAS_SITUATION_BUILDER".to_string(),
                self.has_situation_builder.to_string(),
            ),
        ];
        if let Some(config_file) = &self.config_file {
            env.push(("CONFIG_FILE".to_string(), config_file.clone()));
        }
        env
    }
}

/// Backend-A client options.
#[derive(Debug, Clone)]
pub struct AlphaOptions {
    pub system_prompt: String,
    pub model: String,
    /// Resume session id; `None` starts a fresh session.
    pub resume: Option<String>,
    pub tool_env: ToolServerEnv,
    /// Post-tool-use hook capture channel for skip/policy-check.
    pub hooks: HookCaptures,
}

/// Backend-B client options.
#[derive(Debug, Clone)]
pub struct BetaOptions {
    pub base_instructions: String,
    pub model: Option<String>,
    /// Thread id; `None` starts a fresh thread.
    pub thread_id: Option<String>,
    pub cwd: PathBuf,
    pub sandbox: String,
    pub approval_policy: String,
    pub tool_env: ToolServerEnv,
}

/// Tagged client options; the pool reads session ids through the accessor
/// and never reflects over backend-specific fields.
#[derive(Debug, Clone)]
pub enum ClientOptions {
    Alpha(AlphaOptions),
    Beta(BetaOptions),
}

impl ClientOptions {
    pub fn backend(&self) -> BackendKind {
        match self {
            Self::Alpha(_) => BackendKind::Alpha,
            Self::Beta(_) => BackendKind::Beta,
        }
    }

    /// The backend continuity handle carried by these options.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Alpha(options) => options.resume.as_deref(),
            Self::Beta(options) => options.thread_id.as_deref(),
        }
    }

    /// Clear the continuity handle (session recovery retry path).
    pub fn clear_session(&mut self) {
        match self {
            Self::Alpha(options) => options.resume = None,
            Self::Beta(options) => options.thread_id = None,
        }
    }
}

/// Raw event from a backend stream, parsed by the matching [`StreamParser`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawStreamEvent {
    Alpha(AlphaMessage),
    Beta(BetaEvent),
}

/// Cheap handle for interrupting a live turn without locking the client.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl InterruptHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Signal the client to interrupt. Returns false when the client side
    /// is already gone.
    pub fn interrupt(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// One backend connection for a (room, agent) task.
#[async_trait]
pub trait BackendClient: Send {
    async fn connect(&mut self) -> Result<(), BackendError>;

    async fn disconnect(&mut self) -> Result<(), BackendError>;

    /// Send the turn's message. Must not block on response reception.
    async fn query(&mut self, content: QueryContent) -> Result<(), BackendError>;

    /// Next raw event from the current turn; `None` when the stream ends.
    async fn next_event(&mut self) -> Option<RawStreamEvent>;

    /// Handle usable to interrupt this client from another task.
    fn interrupt_handle(&self) -> InterruptHandle;

    /// Session/thread id observed on this connection, if any.
    fn session_id(&self) -> Option<String>;

    fn options(&self) -> &ClientOptions;

    /// Update options in place (system prompt changes between turns).
    fn set_options(&mut self, options: ClientOptions);
}

/// Pure converter from raw backend events to the unified parse model.
pub trait StreamParser: Send + Sync {
    fn parse(
        &self,
        event: &RawStreamEvent,
        response_text: &str,
        thinking_text: &str,
    ) -> ParsedStreamMessage;
}

/// Provider-facing context for one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub task_id: TaskId,
    pub backend: BackendKind,
    pub system_prompt: String,
    pub message: QueryContent,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub agent_group: String,
    pub config_file: Option<String>,
    pub session_id: Option<String>,
    pub has_situation_builder: bool,
    /// Wall-clock line appended to the system prompt.
    pub conversation_started: Option<String>,
}

impl TurnRequest {
    /// Final system prompt with the timestamp line appended.
    pub fn final_system_prompt(&self) -> String {
        match &self.conversation_started {
            Some(started) => {
                format!("{}\n\n---\n\nCurrent time: {}", self.system_prompt, started)
            }
            None => self.system_prompt.clone(),
        }
    }
}

/// Factory for clients and parsers of one backend family.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Translate a turn request into backend-specific options.
    fn build_options(&self, request: &TurnRequest, hooks: HookCaptures) -> ClientOptions;

    fn create_client(&self, options: ClientOptions) -> Box<dyn BackendClient>;

    fn parser(&self) -> Arc<dyn StreamParser>;

    /// Whether the backend binary/runtime is present and authenticated.
    async fn check_availability(&self) -> bool;

    fn session_field_name(&self) -> &'static str {
        self.kind().session_field_name()
    }
}

/// Provider registry keyed by backend kind.
pub type ProviderMap = HashMap<BackendKind, Arc<dyn Provider>>;

/// Resolve a binary against PATH (absolute paths checked directly).
pub(crate) fn binary_on_path(command: &std::path::Path) -> bool {
    if command.is_absolute() {
        return command.exists();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(command).exists())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn options_session_id_is_backend_agnostic() {
        let alpha = ClientOptions::Alpha(AlphaOptions {
            system_prompt: String::new(),
            model: String::new(),
            resume: Some("s-1".to_string()),
            tool_env: ToolServerEnv::default(),
            hooks: HookCaptures::disabled(),
        });
        assert_eq!(alpha.session_id(), Some("s-1"));

        let mut beta = ClientOptions::Beta(BetaOptions {
            base_instructions: String::new(),
            model: None,
            thread_id: Some("T-9".to_string()),
            cwd: PathBuf::from("."),
            sandbox: "read-only".to_string(),
            approval_policy: "never".to_string(),
            tool_env: ToolServerEnv::default(),
        });
        assert_eq!(beta.session_id(), Some("T-9"));
        beta.clear_session();
        assert_eq!(beta.session_id(), None);
    }

    #[test]
    fn query_content_flattens_text() {
        let content = QueryContent::Blocks(vec![
            ContentBlock::Text { text: "a".to_string() },
            ContentBlock::Image {
                source: InlineImage {
                    data: "aGk=".to_string(),
                    media_type: "image/png".to_string(),
                },
            },
            ContentBlock::Text { text: "b".to_string() },
        ]);
        assert_eq!(content.to_text(), "a\nb");
        assert!(content.has_images());
    }

    #[test]
    fn tool_env_includes_optional_config_file() {
        let mut env = ToolServerEnv {
            agent_name: "Ada".to_string(),
            agent_id: AgentId(1),
            agent_group: "default".to_string(),
            config_file: None,
            room_id: RoomId(2),
            backend: "alpha".to_string(),
            has_situation_builder: false,
        };
        let vars = env.to_env();
        assert!(vars.iter().all(|(k, _)| k != "CONFIG_FILE"));

        env.config_file = Some("/personas/ada".to_string());
        let vars = env.to_env();
        assert!(vars.contains(&("CONFIG_FILE".to_string(), "/personas/ada".to_string())));
    }

    #[test]
    fn transient_transport_detection() {
        assert!(BackendError::Transport("ProcessTransport is not ready".to_string())
            .is_transient_transport());
        assert!(!BackendError::Protocol("bad frame".to_string()).is_transient_transport());
    }
}
