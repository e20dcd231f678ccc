//! Backend-A provider: long-lived agent client per (room, agent) task.
//!
//! The client owns one agent subprocess speaking typed stream-JSON on
//! stdio. It stays connected across turns; each `query` starts a new turn
//! on the same session. Post-tool-use hooks for skip/policy-check fire from
//! the stdout reader as tool_use blocks are observed.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use roundtable_core::stream::alpha::{self, AlphaBlock, AlphaMessage};

use super::{
    AlphaOptions, BackendClient, BackendError, ClientOptions, ContentBlock, HookCaptures,
    InterruptHandle, Provider, QueryContent, RawStreamEvent, StreamParser, TurnRequest,
    binary_on_path,
};
use crate::domain::BackendKind;

/// Grace period between SIGTERM and SIGKILL on disconnect.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Event channel capacity between the stdout reader and `next_event`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Backend-A provider.
pub struct AlphaProvider {
    command: PathBuf,
}

impl AlphaProvider {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self { command: command.into() }
    }
}

#[async_trait]
impl Provider for AlphaProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Alpha
    }

    fn build_options(&self, request: &TurnRequest, hooks: HookCaptures) -> ClientOptions {
        ClientOptions::Alpha(AlphaOptions {
            system_prompt: request.final_system_prompt(),
            model: String::new(),
            resume: request.session_id.clone(),
            tool_env: super::ToolServerEnv {
                agent_name: request.agent_name.clone(),
                agent_id: request.agent_id,
                agent_group: request.agent_group.clone(),
                config_file: request.config_file.clone(),
                room_id: request.task_id.room_id,
                backend: BackendKind::Alpha.as_str().to_string(),
                has_situation_builder: request.has_situation_builder,
            },
            hooks,
        })
    }

    fn create_client(&self, options: ClientOptions) -> Box<dyn BackendClient> {
        Box::new(AlphaClient::new(self.command.clone(), options))
    }

    fn parser(&self) -> Arc<dyn StreamParser> {
        Arc::new(AlphaStreamParser)
    }

    async fn check_availability(&self) -> bool {
        binary_on_path(&self.command)
    }
}

/// Parser adapter over the core backend-A grammar.
pub struct AlphaStreamParser;

impl StreamParser for AlphaStreamParser {
    fn parse(
        &self,
        event: &RawStreamEvent,
        response_text: &str,
        thinking_text: &str,
    ) -> roundtable_core::stream::ParsedStreamMessage {
        match event {
            RawStreamEvent::Alpha(message) => {
                alpha::parse_message(message, response_text, thinking_text)
            }
            RawStreamEvent::Beta(_) => roundtable_core::stream::ParsedStreamMessage {
                response_text: response_text.to_string(),
                thinking_text: thinking_text.to_string(),
                ..Default::default()
            },
        }
    }
}

/// Backend-A client over a long-lived subprocess.
pub struct AlphaClient {
    command: PathBuf,
    options: ClientOptions,
    child: Option<Child>,
    stdin_tx: Option<mpsc::Sender<String>>,
    events_rx: Option<mpsc::Receiver<RawStreamEvent>>,
    interrupt_handle: InterruptHandle,
    interrupt_rx: Option<mpsc::UnboundedReceiver<()>>,
    observed_session: Arc<Mutex<Option<String>>>,
    /// Hook sink of the current turn. The stdout reader outlives turns on
    /// a pooled client, so it reads the sink through this slot instead of
    /// capturing one turn's channel.
    hook_slot: Arc<Mutex<HookCaptures>>,
}

impl AlphaClient {
    pub fn new(command: PathBuf, options: ClientOptions) -> Self {
        let (interrupt_handle, interrupt_rx) = InterruptHandle::new();
        let hooks = match &options {
            ClientOptions::Alpha(alpha) => alpha.hooks.clone(),
            ClientOptions::Beta(_) => HookCaptures::disabled(),
        };
        Self {
            command,
            options,
            child: None,
            stdin_tx: None,
            events_rx: None,
            interrupt_handle,
            interrupt_rx: Some(interrupt_rx),
            observed_session: Arc::new(Mutex::new(None)),
            hook_slot: Arc::new(Mutex::new(hooks)),
        }
    }

    fn alpha_options(&self) -> Result<&AlphaOptions, BackendError> {
        match &self.options {
            ClientOptions::Alpha(options) => Ok(options),
            ClientOptions::Beta(_) => Err(BackendError::Protocol(
                "alpha client configured with beta options".to_string(),
            )),
        }
    }
}

#[async_trait]
impl BackendClient for AlphaClient {
    async fn connect(&mut self) -> Result<(), BackendError> {
        if self.child.is_some() {
            return Ok(());
        }
        if !binary_on_path(&self.command) {
            return Err(BackendError::Unavailable(format!(
                "{} not found in PATH",
                self.command.display()
            )));
        }
        let options = self.alpha_options()?.clone();

        let mut cmd = Command::new(&self.command);
        cmd.arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        cmd.arg("--system-prompt").arg(&options.system_prompt);
        if !options.model.is_empty() {
            cmd.arg("--model").arg(&options.model);
        }
        if let Some(resume) = &options.resume {
            cmd.arg("--resume").arg(resume);
        }
        for (key, value) in options.tool_env.to_env() {
            cmd.env(key, value);
        }

        info!(
            command = %self.command.display(),
            resume = ?options.resume,
            "Spawning backend-A client"
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Transport(format!("spawn failed: {e}")))?;

        // Stdin writer task.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Transport("Failed to capture stdin".to_string()))?;
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // Stdout reader: parse typed messages, fire tool hooks, forward.
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Transport("Failed to capture stdout".to_string()))?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let hook_slot = Arc::clone(&self.hook_slot);
        let observed_session = Arc::clone(&self.observed_session);
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match alpha::parse_line(&line) {
                    Ok(message) => {
                        let hooks = hook_slot
                            .lock()
                            .map(|guard| guard.clone())
                            .unwrap_or_else(|_| HookCaptures::disabled());
                        observe_message(&message, &hooks, &observed_session);
                        if events_tx.send(RawStreamEvent::Alpha(message)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "Dropping unparseable stream line"),
                }
            }
            debug!("backend-A stdout reader finished");
        });

        // Stderr for diagnostics.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("backend-A stderr: {}", line);
                }
            });
        }

        // Interrupt listener writes the control line without touching the
        // client lock.
        if let Some(mut interrupt_rx) = self.interrupt_rx.take() {
            let interrupt_stdin = stdin_tx.clone();
            tokio::spawn(async move {
                while interrupt_rx.recv().await.is_some() {
                    let line = json!({"type": "control", "subtype": "interrupt"}).to_string();
                    if interrupt_stdin.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }

        self.child = Some(child);
        self.stdin_tx = Some(stdin_tx);
        self.events_rx = Some(events_rx);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BackendError> {
        let Some(mut child) = self.child.take() else {
            return Err(BackendError::Transport("no active connection".to_string()));
        };
        self.stdin_tx = None;
        self.events_rx = None;

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from our own Child handle; kill(2) with
            // SIGTERM is safe on an owned subprocess.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGTERM");
            }
        }

        match tokio::time::timeout(TERMINATE_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "backend-A client exited"),
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for backend-A client");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!("Timeout waiting for backend-A client shutdown, killing");
                child.kill().await.ok();
            }
        }
        Ok(())
    }

    async fn query(&mut self, content: QueryContent) -> Result<(), BackendError> {
        let stdin_tx = self
            .stdin_tx
            .as_ref()
            .ok_or_else(|| BackendError::Transport("client not connected".to_string()))?;

        let message = match content {
            QueryContent::Text(text) => json!({
                "type": "user",
                "message": {"role": "user", "content": text},
            }),
            QueryContent::Blocks(blocks) => {
                let content: Vec<serde_json::Value> = blocks
                    .iter()
                    .map(|block| match block {
                        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                        ContentBlock::Image { source } => json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": source.media_type,
                                "data": source.data,
                            },
                        }),
                    })
                    .collect();
                json!({
                    "type": "user",
                    "message": {"role": "user", "content": content},
                })
            }
        };

        stdin_tx
            .send(message.to_string())
            .await
            .map_err(|_| BackendError::Transport("client process exited".to_string()))
    }

    async fn next_event(&mut self) -> Option<RawStreamEvent> {
        match &mut self.events_rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt_handle.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.observed_session
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .or_else(|| self.options.session_id().map(String::from))
    }

    fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn set_options(&mut self, options: ClientOptions) {
        if let ClientOptions::Alpha(alpha) = &options {
            if let Ok(mut slot) = self.hook_slot.lock() {
                *slot = alpha.hooks.clone();
            }
        }
        self.options = options;
    }
}

/// Fire hook signals and record the session id as messages stream by.
fn observe_message(
    message: &AlphaMessage,
    hooks: &HookCaptures,
    observed_session: &Arc<Mutex<Option<String>>>,
) {
    match message {
        AlphaMessage::Assistant { content } => {
            for block in content {
                if let AlphaBlock::ToolUse { name, input } = block {
                    hooks.observe_tool_use(name, input);
                }
            }
        }
        AlphaMessage::System { session_id: Some(session_id), .. } => {
            if let Ok(mut guard) = observed_session.lock() {
                *guard = Some(session_id.clone());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::{AgentId, RoomId, TaskId};
    use roundtable_core::stream::alpha::parse_line;

    fn request() -> TurnRequest {
        TurnRequest {
            task_id: TaskId::new(RoomId(1), AgentId(2)),
            backend: BackendKind::Alpha,
            system_prompt: "You are Ada.".to_string(),
            message: QueryContent::Text("hi".to_string()),
            agent_id: AgentId(2),
            agent_name: "Ada".to_string(),
            agent_group: "default".to_string(),
            config_file: None,
            session_id: Some("s-1".to_string()),
            has_situation_builder: false,
            conversation_started: Some("2026-08-01 (Sat) 12:00".to_string()),
        }
    }

    #[test]
    fn build_options_carries_session_and_timestamp() {
        let provider = AlphaProvider::new("agent-client");
        let options = provider.build_options(&request(), HookCaptures::disabled());
        assert_eq!(options.session_id(), Some("s-1"));
        let ClientOptions::Alpha(alpha) = options else {
            panic!("expected alpha options");
        };
        assert!(alpha.system_prompt.contains("Current time: 2026-08-01"));
    }

    #[test]
    fn observe_message_fires_skip_hook() {
        let (hooks, mut rx) = HookCaptures::channel();
        let session = Arc::new(Mutex::new(None));
        let message = parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"mcp__social__skip","input":{}}]}}"#,
        )
        .unwrap();
        observe_message(&message, &hooks, &session);
        assert_eq!(rx.try_recv().ok(), Some(super::super::HookSignal::Skip));
    }

    #[test]
    fn observe_message_records_session() {
        let (hooks, _rx) = HookCaptures::channel();
        let session = Arc::new(Mutex::new(None));
        let message =
            parse_line(r#"{"type":"system","subtype":"init","data":{"session_id":"s-9"}}"#)
                .unwrap();
        observe_message(&message, &hooks, &session);
        assert_eq!(session.lock().unwrap().as_deref(), Some("s-9"));
    }

    #[tokio::test]
    async fn query_without_connect_fails() {
        let provider = AlphaProvider::new("agent-client");
        let options = provider.build_options(&request(), HookCaptures::disabled());
        let mut client = AlphaClient::new("agent-client".into(), options);
        let result = client.query(QueryContent::Text("hi".to_string())).await;
        assert!(matches!(result, Err(BackendError::Transport(_))));
    }
}
