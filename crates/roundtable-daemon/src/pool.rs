//! Client pool: one backend client per (room, agent) task.
//!
//! Reusing clients keeps backend sessions warm and avoids spawning a
//! subprocess per turn. Guarded by a global connect semaphore (backend
//! process storms), per-task locks (duplicate creation races), and a
//! background cleanup set (disconnects never block ongoing work).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use roundtable_core::config::PoolConfig;

use crate::domain::{RoomId, TaskId};
use crate::providers::{BackendClient, BackendError, ClientOptions, Provider};

/// Shared handle to a pooled client. The mutex serializes turns; interrupts
/// go through the client's [`InterruptHandle`](crate::providers::InterruptHandle)
/// and never contend here.
pub type PooledClient = Arc<Mutex<Box<dyn BackendClient>>>;

/// Pool of backend clients keyed by task.
pub struct ClientPool {
    config: PoolConfig,
    pool: Mutex<HashMap<TaskId, PooledClient>>,
    task_locks: Mutex<HashMap<TaskId, Arc<Mutex<()>>>>,
    connect_semaphore: Arc<Semaphore>,
    cleanup_tasks: Mutex<JoinSet<()>>,
}

impl ClientPool {
    pub fn new(config: PoolConfig) -> Self {
        let permits = config.max_concurrent_connections.max(1);
        Self {
            config,
            pool: Mutex::new(HashMap::new()),
            task_locks: Mutex::new(HashMap::new()),
            connect_semaphore: Arc::new(Semaphore::new(permits)),
            cleanup_tasks: Mutex::new(JoinSet::new()),
        }
    }

    async fn task_lock(&self, task_id: TaskId) -> Arc<Mutex<()>> {
        let mut locks = self.task_locks.lock().await;
        Arc::clone(locks.entry(task_id).or_default())
    }

    /// Reuse decision for an existing client: `Some(client)` to reuse (with
    /// options updated in place), `None` when the session diverged and the
    /// entry was evicted.
    async fn try_reuse(
        &self,
        task_id: TaskId,
        existing: &PooledClient,
        options: &ClientOptions,
    ) -> Option<PooledClient> {
        let mut client = existing.lock().await;
        let old_session = client.options().session_id().map(String::from);
        let new_session = options.session_id().map(String::from);

        debug!(
            task = %task_id,
            old = ?old_session,
            new = ?new_session,
            "Client exists, comparing sessions"
        );

        if old_session != new_session && (old_session.is_some() || new_session.is_some()) {
            // Session changed: evict without an inline disconnect. The old
            // client's internal lifecycle is tied to the task that built
            // it; a detached drop avoids corrupting concurrent work.
            info!(task = %task_id, "Session changed, evicting pooled client");
            drop(client);
            self.pool.lock().await.remove(&task_id);
            None
        } else {
            client.set_options(options.clone());
            drop(client);
            Some(Arc::clone(existing))
        }
    }

    /// Get the existing client for the task or create and connect a new
    /// one. Returns `(client, is_new)`.
    pub async fn get_or_create(
        &self,
        task_id: TaskId,
        options: ClientOptions,
        provider: &dyn Provider,
    ) -> Result<(PooledClient, bool), BackendError> {
        // Fast path outside the per-task lock.
        let existing = self.pool.lock().await.get(&task_id).cloned();
        if let Some(existing) = existing {
            if let Some(client) = self.try_reuse(task_id, &existing, &options).await {
                return Ok((client, false));
            }
        }

        let task_lock = self.task_lock(task_id).await;
        let _guard = task_lock.lock().await;

        // Double-check: another task may have created it while we waited.
        let existing = self.pool.lock().await.get(&task_id).cloned();
        if let Some(existing) = existing {
            if let Some(client) = self.try_reuse(task_id, &existing, &options).await {
                debug!(task = %task_id, "Client created while waiting for lock");
                return Ok((client, false));
            }
        }

        // Connection creation is bounded process-wide.
        let _permit = self
            .connect_semaphore
            .acquire()
            .await
            .map_err(|_| BackendError::Transport("pool is shut down".to_string()))?;

        debug!(task = %task_id, "Creating new client");
        let mut client = provider.create_client(options);

        let mut attempt = 0;
        loop {
            match client.connect().await {
                Ok(()) => break,
                Err(e)
                    if e.is_transient_transport() && attempt + 1 < self.config.connect_retries =>
                {
                    let delay = Duration::from_millis(
                        self.config.retry_base_delay_ms * (1u64 << attempt),
                    );
                    warn!(
                        task = %task_id,
                        attempt = attempt + 1,
                        retries = self.config.connect_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let client: PooledClient = Arc::new(Mutex::new(client));
        self.pool.lock().await.insert(task_id, Arc::clone(&client));

        // Brief pause lets the connection stabilize before the next one.
        tokio::time::sleep(Duration::from_millis(
            self.config.connection_stabilization_delay_ms,
        ))
        .await;

        Ok((client, true))
    }

    /// Remove a client and disconnect it in the background.
    pub async fn cleanup(&self, task_id: TaskId) {
        let Some(client) = self.pool.lock().await.remove(&task_id) else {
            return;
        };
        info!(task = %task_id, "Cleaning up pooled client");

        let timeout = Duration::from_secs(self.config.disconnect_timeout_secs);
        self.cleanup_tasks.lock().await.spawn(async move {
            let disconnect = async {
                let mut client = client.lock().await;
                client.disconnect().await
            };
            match tokio::time::timeout(timeout, disconnect).await {
                Ok(Ok(())) => debug!(task = %task_id, "Disconnected pooled client"),
                Ok(Err(e)) => {
                    // "no active connection" and cancellation-shaped errors
                    // are benign here.
                    let message = e.to_string().to_lowercase();
                    if !message.contains("no active connection") && !message.contains("cancel") {
                        warn!(task = %task_id, error = %e, "Error disconnecting client");
                    }
                }
                Err(_) => {
                    warn!(task = %task_id, timeout_secs = timeout.as_secs(), "Disconnect timed out");
                }
            }
        });
    }

    /// Clean up every client belonging to a room.
    pub async fn cleanup_room(&self, room_id: RoomId) {
        let task_ids: Vec<TaskId> = self
            .pool
            .lock()
            .await
            .keys()
            .filter(|task| task.room_id == room_id)
            .copied()
            .collect();
        for task_id in task_ids {
            self.cleanup(task_id).await;
        }
    }

    pub async fn contains(&self, task_id: TaskId) -> bool {
        self.pool.lock().await.contains_key(&task_id)
    }

    /// Pool keys belonging to one agent, across rooms (agent deletion
    /// cleanup).
    pub async fn keys_for_agent(&self, agent_id: crate::domain::AgentId) -> Vec<TaskId> {
        self.pool
            .lock()
            .await
            .keys()
            .filter(|task| task.agent_id == agent_id)
            .copied()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.pool.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pool.lock().await.is_empty()
    }

    /// Clean up all clients, then wait for the background disconnects.
    pub async fn shutdown_all(&self) {
        let task_ids: Vec<TaskId> = self.pool.lock().await.keys().copied().collect();
        info!(clients = task_ids.len(), "Shutting down client pool");
        for task_id in task_ids {
            self.cleanup(task_id).await;
        }

        let mut tasks = self.cleanup_tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        info!("Client pool shutdown complete");
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::{AgentId, BackendKind};
    use crate::providers::{
        AlphaOptions, HookCaptures, InterruptHandle, QueryContent, RawStreamEvent, StreamParser,
        ToolServerEnv, TurnRequest,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Client that records connect/disconnect counts.
    struct CountingClient {
        options: ClientOptions,
        interrupt: InterruptHandle,
        connects: Arc<AtomicUsize>,
        fail_connects: usize,
    }

    #[async_trait]
    impl BackendClient for CountingClient {
        async fn connect(&mut self) -> Result<(), BackendError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_connects {
                return Err(BackendError::Transport("transport not ready".to_string()));
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn query(&mut self, _content: QueryContent) -> Result<(), BackendError> {
            Ok(())
        }

        async fn next_event(&mut self) -> Option<RawStreamEvent> {
            None
        }

        fn interrupt_handle(&self) -> InterruptHandle {
            self.interrupt.clone()
        }

        fn session_id(&self) -> Option<String> {
            self.options.session_id().map(String::from)
        }

        fn options(&self) -> &ClientOptions {
            &self.options
        }

        fn set_options(&mut self, options: ClientOptions) {
            self.options = options;
        }
    }

    struct CountingProvider {
        connects: Arc<AtomicUsize>,
        creates: Arc<AtomicUsize>,
        fail_connects: usize,
    }

    struct NoopParser;
    impl StreamParser for NoopParser {
        fn parse(
            &self,
            _event: &RawStreamEvent,
            response_text: &str,
            thinking_text: &str,
        ) -> roundtable_core::stream::ParsedStreamMessage {
            roundtable_core::stream::ParsedStreamMessage {
                response_text: response_text.to_string(),
                thinking_text: thinking_text.to_string(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Provider for CountingProvider {
        fn kind(&self) -> BackendKind {
            BackendKind::Alpha
        }

        fn build_options(&self, request: &TurnRequest, hooks: HookCaptures) -> ClientOptions {
            ClientOptions::Alpha(AlphaOptions {
                system_prompt: request.system_prompt.clone(),
                model: String::new(),
                resume: request.session_id.clone(),
                tool_env: ToolServerEnv::default(),
                hooks,
            })
        }

        fn create_client(&self, options: ClientOptions) -> Box<dyn BackendClient> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let (interrupt, _rx) = InterruptHandle::new();
            Box::new(CountingClient {
                options,
                interrupt,
                connects: Arc::clone(&self.connects),
                fail_connects: self.fail_connects,
            })
        }

        fn parser(&self) -> Arc<dyn StreamParser> {
            Arc::new(NoopParser)
        }

        async fn check_availability(&self) -> bool {
            true
        }
    }

    fn options(session: Option<&str>) -> ClientOptions {
        ClientOptions::Alpha(AlphaOptions {
            system_prompt: "sys".to_string(),
            model: String::new(),
            resume: session.map(String::from),
            tool_env: ToolServerEnv::default(),
            hooks: HookCaptures::disabled(),
        })
    }

    fn provider(fail_connects: usize) -> CountingProvider {
        CountingProvider {
            connects: Arc::new(AtomicUsize::new(0)),
            creates: Arc::new(AtomicUsize::new(0)),
            fail_connects,
        }
    }

    fn fast_config() -> PoolConfig {
        PoolConfig {
            connection_stabilization_delay_ms: 0,
            retry_base_delay_ms: 1,
            ..Default::default()
        }
    }

    fn task() -> TaskId {
        TaskId::new(RoomId(1), AgentId(1))
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let pool = ClientPool::new(fast_config());
        let provider = provider(0);

        let (first, is_new) = pool
            .get_or_create(task(), options(Some("s-1")), &provider)
            .await
            .unwrap();
        assert!(is_new);

        let (second, is_new) = pool
            .get_or_create(task(), options(Some("s-1")), &provider)
            .await
            .unwrap();
        assert!(!is_new);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_change_evicts_and_recreates() {
        let pool = ClientPool::new(fast_config());
        let provider = provider(0);

        let (first, _) = pool
            .get_or_create(task(), options(Some("s-1")), &provider)
            .await
            .unwrap();
        let (second, is_new) = pool
            .get_or_create(task(), options(Some("s-2")), &provider)
            .await
            .unwrap();

        assert!(is_new);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(provider.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn both_sessions_none_reuses() {
        let pool = ClientPool::new(fast_config());
        let provider = provider(0);

        let (_, _) = pool
            .get_or_create(task(), options(None), &provider)
            .await
            .unwrap();
        let (_, is_new) = pool
            .get_or_create(task(), options(None), &provider)
            .await
            .unwrap();
        assert!(!is_new);
    }

    #[tokio::test]
    async fn transient_connect_errors_are_retried() {
        let pool = ClientPool::new(fast_config());
        let provider = provider(2);

        let (_, is_new) = pool
            .get_or_create(task(), options(None), &provider)
            .await
            .unwrap();
        assert!(is_new);
        assert_eq!(provider.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let pool = ClientPool::new(fast_config());
        let provider = provider(10);

        let result = pool.get_or_create(task(), options(None), &provider).await;
        assert!(result.is_err());
        assert_eq!(provider.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cleanup_room_removes_only_that_room() {
        let pool = ClientPool::new(fast_config());
        let provider = provider(0);

        let task_a = TaskId::new(RoomId(1), AgentId(1));
        let task_b = TaskId::new(RoomId(2), AgentId(1));
        pool.get_or_create(task_a, options(None), &provider).await.unwrap();
        pool.get_or_create(task_b, options(None), &provider).await.unwrap();

        pool.cleanup_room(RoomId(1)).await;
        assert!(!pool.contains(task_a).await);
        assert!(pool.contains(task_b).await);
    }

    #[tokio::test]
    async fn keys_for_agent_spans_rooms() {
        let pool = ClientPool::new(fast_config());
        let provider = provider(0);

        let task_a = TaskId::new(RoomId(1), AgentId(1));
        let task_b = TaskId::new(RoomId(2), AgentId(1));
        let task_c = TaskId::new(RoomId(1), AgentId(2));
        for task in [task_a, task_b, task_c] {
            pool.get_or_create(task, options(None), &provider).await.unwrap();
        }

        let mut keys = pool.keys_for_agent(AgentId(1)).await;
        keys.sort_by_key(|t| t.room_id);
        assert_eq!(keys, vec![task_a, task_b]);
    }

    #[tokio::test]
    async fn shutdown_drains_background_cleanups() {
        let pool = ClientPool::new(fast_config());
        let provider = provider(0);
        pool.get_or_create(task(), options(None), &provider).await.unwrap();

        pool.shutdown_all().await;
        assert!(pool.is_empty().await);
    }
}
