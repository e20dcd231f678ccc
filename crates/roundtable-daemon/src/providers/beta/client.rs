//! Backend-B client over the app-server pool.
//!
//! Resolves the agent's pooled instance, resumes the persisted thread when
//! its owning instance is gone (restart, eviction, crash), and surfaces an
//! unknown thread id as [`BackendError::SessionRecovery`] so the response
//! generator can replay full history under a fresh thread.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info};

use roundtable_core::stream::beta::{self, BetaEvent};

use crate::domain::BackendKind;
use crate::providers::{
    BackendClient, BackendError, BetaOptions, ClientOptions, ContentBlock, HookCaptures,
    InterruptHandle, Provider, QueryContent, RawStreamEvent, StreamParser, ToolServerEnv,
    TurnRequest, binary_on_path,
};

use super::instance::{AppServerInstance, StartupConfig, TurnConfig, TurnHandle};
use super::pool::AppServerPool;

/// Backend-B provider over a shared app-server pool.
pub struct BetaProvider {
    pool: Arc<AppServerPool>,
}

impl BetaProvider {
    pub fn new(pool: Arc<AppServerPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Provider for BetaProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Beta
    }

    fn build_options(&self, request: &TurnRequest, _hooks: HookCaptures) -> ClientOptions {
        // Backend-B has no hook path; skip/memorize/policy-check all come
        // from the stream parser.
        ClientOptions::Beta(BetaOptions {
            base_instructions: request.final_system_prompt(),
            model: None,
            thread_id: request.session_id.clone(),
            cwd: std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()),
            sandbox: "read-only".to_string(),
            approval_policy: "never".to_string(),
            tool_env: ToolServerEnv {
                agent_name: request.agent_name.clone(),
                agent_id: request.agent_id,
                agent_group: request.agent_group.clone(),
                config_file: request.config_file.clone(),
                room_id: request.task_id.room_id,
                backend: BackendKind::Beta.as_str().to_string(),
                has_situation_builder: request.has_situation_builder,
            },
        })
    }

    fn create_client(&self, options: ClientOptions) -> Box<dyn BackendClient> {
        Box::new(BetaClient::new(Arc::clone(&self.pool), options))
    }

    fn parser(&self) -> Arc<dyn StreamParser> {
        Arc::new(BetaStreamParser)
    }

    async fn check_availability(&self) -> bool {
        binary_on_path(std::path::Path::new(&self.pool.config().command))
    }
}

/// Parser adapter over the core backend-B grammar.
pub struct BetaStreamParser;

impl StreamParser for BetaStreamParser {
    fn parse(
        &self,
        event: &RawStreamEvent,
        response_text: &str,
        thinking_text: &str,
    ) -> roundtable_core::stream::ParsedStreamMessage {
        match event {
            RawStreamEvent::Beta(event) => beta::parse_message(event, response_text, thinking_text),
            RawStreamEvent::Alpha(_) => roundtable_core::stream::ParsedStreamMessage {
                response_text: response_text.to_string(),
                thinking_text: thinking_text.to_string(),
                ..Default::default()
            },
        }
    }
}

/// One agent's connection to its pooled app-server instance.
pub struct BetaClient {
    pool: Arc<AppServerPool>,
    options: ClientOptions,
    instance: Option<Arc<AppServerInstance>>,
    turn: Option<TurnHandle>,
    interrupt_handle: InterruptHandle,
    interrupt_rx: Option<mpsc::UnboundedReceiver<()>>,
    observed_thread: Option<String>,
}

impl BetaClient {
    pub fn new(pool: Arc<AppServerPool>, options: ClientOptions) -> Self {
        let (interrupt_handle, interrupt_rx) = InterruptHandle::new();
        Self {
            pool,
            options,
            instance: None,
            turn: None,
            interrupt_handle,
            interrupt_rx: Some(interrupt_rx),
            observed_thread: None,
        }
    }

    fn beta_options(&self) -> Result<&BetaOptions, BackendError> {
        match &self.options {
            ClientOptions::Beta(options) => Ok(options),
            ClientOptions::Alpha(_) => Err(BackendError::Protocol(
                "beta client configured with alpha options".to_string(),
            )),
        }
    }

    fn agent_key(&self) -> Result<String, BackendError> {
        let options = self.beta_options()?;
        Ok(format!(
            "room-{}-agent-{}",
            options.tool_env.room_id, options.tool_env.agent_id
        ))
    }

    fn startup_config(&self) -> Result<StartupConfig, BackendError> {
        let options = self.beta_options()?;
        let pool_config = self.pool.config();
        Ok(StartupConfig {
            command: pool_config.command.clone(),
            disabled_features: pool_config.disabled_features.clone(),
            overrides: pool_config.overrides.clone(),
            env: options.tool_env.to_env(),
            request_timeout: std::time::Duration::from_secs(pool_config.request_timeout_secs),
        })
    }

    fn turn_config(&self) -> Result<TurnConfig, BackendError> {
        let options = self.beta_options()?;
        Ok(TurnConfig {
            cwd: options.cwd.to_string_lossy().into_owned(),
            model: options.model.clone(),
            base_instructions: options.base_instructions.clone(),
            sandbox: options.sandbox.clone(),
            approval_policy: options.approval_policy.clone(),
        })
    }

    fn thread_id(&self) -> Option<String> {
        self.observed_thread
            .clone()
            .or_else(|| self.options.session_id().map(String::from))
    }
}

#[async_trait]
impl BackendClient for BetaClient {
    async fn connect(&mut self) -> Result<(), BackendError> {
        let agent_key = self.agent_key()?;
        let startup = self.startup_config()?;
        let instance = self.pool.get_or_create_instance(&agent_key, &startup).await?;

        // Resume the persisted thread when this instance does not own it
        // (fresh instance after restart, eviction or crash).
        if let Some(thread_id) = self.options.session_id().map(String::from) {
            let owned_here = instance.owns_thread(&thread_id)
                || self
                    .pool
                    .instance_for_thread(&thread_id)
                    .await
                    .is_some_and(|owner| owner.instance_id() == instance.instance_id());
            if !owned_here {
                let cwd = self.turn_config()?.cwd;
                if let Err(e) = instance.resume_thread(&thread_id, &cwd).await {
                    if matches!(e, BackendError::SessionRecovery { .. }) {
                        // The backend no longer knows this thread; stop
                        // tracking it.
                        self.pool.threads().release(&thread_id);
                    }
                    return Err(e);
                }
                self.pool
                    .threads()
                    .register(&thread_id, &agent_key, Some(instance.instance_id()));
            }
            self.observed_thread = Some(thread_id);
        }

        // Interrupt listener: fires turn/interrupt without touching the
        // client lock.
        if let Some(mut interrupt_rx) = self.interrupt_rx.take() {
            let instance_for_interrupt = Arc::clone(&instance);
            tokio::spawn(async move {
                while interrupt_rx.recv().await.is_some() {
                    if let Err(e) = instance_for_interrupt.interrupt_current_turn().await {
                        debug!(error = %e, "Turn interrupt failed");
                    }
                }
            });
        }

        self.instance = Some(instance);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BackendError> {
        // The instance is pooled; its lifetime belongs to the app-server
        // pool's idle reaper. Dropping the turn handle releases the
        // request lock.
        self.turn = None;
        self.instance = None;
        Ok(())
    }

    async fn query(&mut self, content: QueryContent) -> Result<(), BackendError> {
        let instance = self
            .instance
            .clone()
            .ok_or_else(|| BackendError::Transport("client not connected".to_string()))?;
        let turn_config = self.turn_config()?;

        let thread_id = match self.thread_id() {
            Some(thread_id) => thread_id,
            None => {
                let thread_id = instance.start_thread(&turn_config).await?;
                let agent_key = self.agent_key()?;
                self.pool
                    .threads()
                    .register(&thread_id, &agent_key, Some(instance.instance_id()));
                info!(thread_id, agent_key, "Started fresh thread");
                self.observed_thread = Some(thread_id.clone());
                thread_id
            }
        };

        let input = build_input_items(&content);
        let turn = instance.run_turn(&thread_id, input, &turn_config).await?;
        self.turn = Some(turn);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<RawStreamEvent> {
        let turn = self.turn.as_mut()?;
        let event = turn.events.recv().await?;

        if let BetaEvent::ThreadStarted { thread_id } = &event {
            if !thread_id.is_empty() {
                self.observed_thread = Some(thread_id.clone());
            }
        }
        // Terminal event: release the per-instance request lock.
        if matches!(event, BetaEvent::TurnCompleted { .. }) {
            self.turn = None;
        }

        Some(RawStreamEvent::Beta(event))
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt_handle.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.thread_id()
    }

    fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn set_options(&mut self, options: ClientOptions) {
        self.options = options;
    }
}

/// Turn input items: text and PNG images.
fn build_input_items(content: &QueryContent) -> Vec<Value> {
    match content {
        QueryContent::Text(text) => vec![json!({"type": "text", "text": text})],
        QueryContent::Blocks(blocks) => blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                ContentBlock::Image { source } => json!({
                    "type": "image",
                    "mediaType": source.media_type,
                    "data": source.data,
                }),
            })
            .collect(),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::{AgentId, InlineImage, RoomId, TaskId};
    use roundtable_core::config::AppServerConfig;

    fn request() -> TurnRequest {
        TurnRequest {
            task_id: TaskId::new(RoomId(4), AgentId(9)),
            backend: BackendKind::Beta,
            system_prompt: "You are Grace.".to_string(),
            message: QueryContent::Text("hi".to_string()),
            agent_id: AgentId(9),
            agent_name: "Grace".to_string(),
            agent_group: "default".to_string(),
            config_file: None,
            session_id: Some("T-1".to_string()),
            has_situation_builder: true,
            conversation_started: None,
        }
    }

    #[tokio::test]
    async fn build_options_maps_thread_id() {
        let pool = AppServerPool::new(AppServerConfig::default());
        let provider = BetaProvider::new(pool);
        let options = provider.build_options(&request(), HookCaptures::disabled());
        assert_eq!(options.session_id(), Some("T-1"));
        assert_eq!(options.backend(), BackendKind::Beta);
    }

    #[test]
    fn input_items_carry_images() {
        let content = QueryContent::Blocks(vec![
            ContentBlock::Text { text: "look".to_string() },
            ContentBlock::Image {
                source: InlineImage {
                    data: "aGk=".to_string(),
                    media_type: "image/png".to_string(),
                },
            },
        ]);
        let items = build_input_items(&content);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["type"], "image");
        assert_eq!(items[1]["mediaType"], "image/png");
    }

    #[tokio::test]
    async fn query_without_connect_fails() {
        let pool = AppServerPool::new(AppServerConfig::default());
        let provider = BetaProvider::new(Arc::clone(&pool));
        let options = provider.build_options(&request(), HookCaptures::disabled());
        let mut client = BetaClient::new(pool, options);
        let result = client.query(QueryContent::Text("hi".to_string())).await;
        assert!(matches!(result, Err(BackendError::Transport(_))));
    }
}
