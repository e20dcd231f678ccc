//! Agent manager: drives one backend turn and owns streaming state.
//!
//! The manager is the central actor during a turn. It owns the interrupt
//! handles of live turns, the rolling accumulators visible to late SSE
//! subscribers, and the per-backend client pools. `generate_response`
//! yields [`TurnEvent`]s to the response generator and broadcasts
//! stream-start and delta events to the room; the terminal `stream_end` is
//! broadcast by the caller once the persist decision is made.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use roundtable_core::config::PoolConfig;
use roundtable_core::stream::{StreamAccumulator, StreamDelta, StreamingSnapshot};

use crate::domain::{AgentId, BackendKind, RoomId, TaskId};
use crate::pool::ClientPool;
use crate::providers::{
    BackendError, HookCaptures, HookSignal, InterruptHandle, ProviderMap, TurnRequest,
};
use crate::sse::{EventBroadcaster, RoomEvent};

/// Watchdog on sending the query: the send itself must not hang even when
/// reception is slow.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal state of one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub temp_id: String,
    pub response_text: Option<String>,
    pub thinking_text: String,
    pub session_id: Option<String>,
    pub memory_entries: Vec<String>,
    pub policy_check_calls: Vec<String>,
    pub skipped: bool,
    /// True when `response_text` is an error message rather than agent
    /// output; error turns are never persisted.
    pub is_error: bool,
}

impl TurnOutcome {
    fn error_with(temp_id: String, session_id: Option<String>, error: &str) -> Self {
        Self {
            temp_id,
            response_text: Some(format!("Error generating response: {error}")),
            thinking_text: String::new(),
            session_id,
            memory_entries: Vec::new(),
            policy_check_calls: Vec::new(),
            skipped: false,
            is_error: true,
        }
    }
}

/// Events yielded by [`AgentManager::generate_response`].
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    StreamStart { temp_id: String },
    ContentDelta { temp_id: String, delta: String },
    ThinkingDelta { temp_id: String, delta: String },
    /// The backend lost the persisted thread; retry once with full
    /// history and a cleared session. No `StreamEnd` follows this event.
    SessionRecovery { temp_id: String, old_thread_id: String },
    StreamEnd(TurnOutcome),
}

/// Manages backend clients for agent response generation and interruption.
pub struct AgentManager {
    providers: ProviderMap,
    pool_config: PoolConfig,
    pools: Mutex<HashMap<BackendKind, Arc<ClientPool>>>,
    active: Mutex<HashMap<TaskId, InterruptHandle>>,
    streaming: Mutex<HashMap<TaskId, (String, StreamingSnapshot)>>,
    broadcaster: Arc<EventBroadcaster>,
}

impl AgentManager {
    pub fn new(
        providers: ProviderMap,
        pool_config: PoolConfig,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            providers,
            pool_config,
            pools: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            streaming: Mutex::new(HashMap::new()),
            broadcaster,
        }
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    async fn pool_for(&self, backend: BackendKind) -> Arc<ClientPool> {
        let mut pools = self.pools.lock().await;
        Arc::clone(
            pools
                .entry(backend)
                .or_insert_with(|| Arc::new(ClientPool::new(self.pool_config.clone()))),
        )
    }

    /// Interrupt all currently active turns. Pooled clients stay: reuse is
    /// still desirable.
    pub async fn interrupt_all(&self) {
        let mut active = self.active.lock().await;
        info!(count = active.len(), "Interrupting all active agents");
        for (task_id, handle) in active.drain() {
            if !handle.interrupt() {
                warn!(task = %task_id, "Interrupt target already gone");
            }
        }
    }

    /// Interrupt the turns of one room.
    pub async fn interrupt_room(&self, room_id: RoomId) {
        let mut active = self.active.lock().await;
        let task_ids: Vec<TaskId> = active
            .keys()
            .filter(|task| task.room_id == room_id)
            .copied()
            .collect();
        info!(room = %room_id, count = task_ids.len(), "Interrupting room agents");
        for task_id in task_ids {
            if let Some(handle) = active.remove(&task_id) {
                if !handle.interrupt() {
                    warn!(task = %task_id, "Interrupt target already gone");
                }
            }
        }
    }

    /// Streaming snapshots for agents currently mid-turn in a room.
    pub async fn streaming_snapshot_for_room(
        &self,
        room_id: RoomId,
    ) -> Vec<(AgentId, StreamingSnapshot)> {
        self.streaming
            .lock()
            .await
            .iter()
            .filter(|(task, _)| task.room_id == room_id)
            .map(|(task, (_, snapshot))| (task.agent_id, snapshot.clone()))
            .collect()
    }

    /// Synthesized `stream_start` events for a new SSE subscriber: one per
    /// agent currently mid-turn, carrying the partial accumulated text so
    /// the subscriber catches up before live events resume.
    pub async fn catch_up_events(&self, room_id: RoomId) -> Vec<RoomEvent> {
        self.streaming
            .lock()
            .await
            .iter()
            .filter(|(task, _)| task.room_id == room_id)
            .map(|(task, (temp_id, snapshot))| RoomEvent::StreamStart {
                temp_id: temp_id.clone(),
                agent_id: task.agent_id,
                agent_name: None,
                response_text: snapshot.response_text.clone(),
                thinking_text: snapshot.thinking_text.clone(),
            })
            .collect()
    }

    /// Drop all pooled clients of a room (room cleared or deleted).
    pub async fn cleanup_room(&self, room_id: RoomId) {
        let pools: Vec<Arc<ClientPool>> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.cleanup_room(room_id).await;
        }
    }

    /// Graceful shutdown of every pooled client.
    pub async fn shutdown(&self) {
        info!("Shutting down agent manager");
        let pools: Vec<Arc<ClientPool>> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.shutdown_all().await;
        }
        info!("Agent manager shutdown complete");
    }

    async fn register_turn(&self, task_id: TaskId, temp_id: &str, handle: InterruptHandle) {
        self.active.lock().await.insert(task_id, handle);
        self.streaming
            .lock()
            .await
            .insert(task_id, (temp_id.to_string(), StreamingSnapshot::default()));
    }

    async fn unregister_turn(&self, task_id: TaskId) {
        self.active.lock().await.remove(&task_id);
        self.streaming.lock().await.remove(&task_id);
    }

    async fn update_streaming(&self, task_id: TaskId, snapshot: StreamingSnapshot) {
        if let Some((_, entry)) = self.streaming.lock().await.get_mut(&task_id) {
            *entry = snapshot;
        }
    }

    /// Drive one turn. Yields exactly one `StreamStart`, zero or more
    /// deltas, then either one `StreamEnd` or one `SessionRecovery`.
    ///
    /// Failures never escape as panics or errors: anything observable as
    /// "the agent didn't answer" collapses to a skipped end event, and
    /// anything observable as "the system broke" collapses to an error end
    /// event.
    pub fn generate_response(
        self: &Arc<Self>,
        request: TurnRequest,
    ) -> impl Stream<Item = TurnEvent> + Send + use<> {
        let manager = Arc::clone(self);

        async_stream::stream! {
            let task_id = request.task_id;
            let room_id = task_id.room_id;
            let temp_id = format!(
                "temp_{}_{}",
                task_id,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            );

            info!(
                task = %task_id,
                session = request.session_id.as_deref().unwrap_or("NEW"),
                temp_id = %temp_id,
                "Agent generating response"
            );

            yield TurnEvent::StreamStart { temp_id: temp_id.clone() };
            manager
                .broadcaster
                .broadcast(room_id, &RoomEvent::StreamStart {
                    temp_id: temp_id.clone(),
                    agent_id: task_id.agent_id,
                    agent_name: Some(request.agent_name.clone()),
                    response_text: String::new(),
                    thinking_text: String::new(),
                })
                .await;

            let Some(provider) = manager.providers.get(&request.backend).cloned() else {
                yield TurnEvent::StreamEnd(TurnOutcome::error_with(
                    temp_id,
                    request.session_id.clone(),
                    &format!("no provider for backend {}", request.backend),
                ));
                return;
            };
            let parser = provider.parser();

            let (hooks, mut hook_rx) = HookCaptures::channel();
            let options = provider.build_options(&request, hooks);
            let pool = manager.pool_for(request.backend).await;

            let client = match pool.get_or_create(task_id, options, provider.as_ref()).await {
                Ok((client, _is_new)) => client,
                Err(BackendError::SessionRecovery { old_thread_id }) => {
                    warn!(task = %task_id, old_thread_id, "Stored thread lost, requesting recovery");
                    pool.cleanup(task_id).await;
                    yield TurnEvent::SessionRecovery { temp_id, old_thread_id };
                    return;
                }
                Err(e) => {
                    warn!(task = %task_id, error = %e, "Failed to obtain client");
                    yield TurnEvent::StreamEnd(TurnOutcome::error_with(
                        temp_id,
                        request.session_id.clone(),
                        &e.to_string(),
                    ));
                    return;
                }
            };

            let mut guard = client.lock().await;
            manager.register_turn(task_id, &temp_id, guard.interrupt_handle()).await;

            let message = request.message.clone();
            let message_len = message.text_len();
            debug!(task = %task_id, message_len, "Sending message to agent");

            let send = tokio::time::timeout(QUERY_TIMEOUT, guard.query(message)).await;
            let send = match send {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(QUERY_TIMEOUT)),
            };
            if let Err(e) = send {
                manager.unregister_turn(task_id).await;
                drop(guard);
                match e {
                    BackendError::SessionRecovery { old_thread_id } => {
                        pool.cleanup(task_id).await;
                        yield TurnEvent::SessionRecovery { temp_id, old_thread_id };
                    }
                    other => {
                        warn!(task = %task_id, error = %other, "Query failed");
                        pool.cleanup(task_id).await;
                        yield TurnEvent::StreamEnd(TurnOutcome::error_with(
                            temp_id,
                            request.session_id.clone(),
                            &other.to_string(),
                        ));
                    }
                }
                return;
            }

            let mut acc = StreamAccumulator::new();
            while let Some(raw_event) = guard.next_event().await {
                // Merge hook-captured tool signals before computing deltas,
                // so content after a skip never leaks.
                while let Ok(signal) = hook_rx.try_recv() {
                    match signal {
                        HookSignal::Skip => acc.mark_skip_used(),
                        HookSignal::PolicyCheck(situation) => acc.record_policy_check(situation),
                    }
                }

                let parsed = parser.parse(&raw_event, acc.response_text(), acc.thinking_text());
                let deltas = acc.apply(&parsed);
                manager.update_streaming(task_id, acc.snapshot()).await;

                for delta in deltas {
                    match delta {
                        StreamDelta::Content(delta) => {
                            manager
                                .broadcaster
                                .broadcast(room_id, &RoomEvent::ContentDelta {
                                    temp_id: temp_id.clone(),
                                    delta: delta.clone(),
                                })
                                .await;
                            yield TurnEvent::ContentDelta { temp_id: temp_id.clone(), delta };
                        }
                        StreamDelta::Thinking(delta) => {
                            manager
                                .broadcaster
                                .broadcast(room_id, &RoomEvent::ThinkingDelta {
                                    temp_id: temp_id.clone(),
                                    delta: delta.clone(),
                                })
                                .await;
                            yield TurnEvent::ThinkingDelta { temp_id: temp_id.clone(), delta };
                        }
                    }
                }

                if acc.is_completed() {
                    break;
                }
            }

            // Late hook signals that raced the terminal event.
            while let Ok(signal) = hook_rx.try_recv() {
                match signal {
                    HookSignal::Skip => acc.mark_skip_used(),
                    HookSignal::PolicyCheck(situation) => acc.record_policy_check(situation),
                }
            }

            let session_id = guard
                .session_id()
                .or_else(|| acc.session_id().map(String::from))
                .or_else(|| request.session_id.clone());
            drop(guard);
            manager.unregister_turn(task_id).await;

            if let Some(error) = acc.error() {
                let error = error.to_string();
                warn!(task = %task_id, error = %error, "Backend reported a failed turn");
                yield TurnEvent::StreamEnd(TurnOutcome::error_with(temp_id, session_id, &error));
                return;
            }

            if acc.skip_used() {
                info!(task = %task_id, "Agent skipped");
                yield TurnEvent::StreamEnd(TurnOutcome {
                    temp_id,
                    response_text: None,
                    thinking_text: acc.thinking_text().to_string(),
                    session_id,
                    memory_entries: acc.memory_entries().to_vec(),
                    policy_check_calls: acc.policy_check_calls().to_vec(),
                    skipped: true,
                    is_error: false,
                });
                return;
            }

            let outcome = TurnOutcome {
                temp_id,
                response_text: acc.final_response().map(String::from),
                thinking_text: acc.thinking_text().to_string(),
                session_id,
                memory_entries: acc.memory_entries().to_vec(),
                policy_check_calls: acc.policy_check_calls().to_vec(),
                skipped: acc.final_response().is_none(),
                is_error: false,
            };
            info!(
                task = %task_id,
                length = outcome.response_text.as_deref().map_or(0, str::len),
                skipped = outcome.skipped,
                "Response generated"
            );
            yield TurnEvent::StreamEnd(outcome);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use roundtable_core::config::SseConfig;

    #[test]
    fn error_outcome_is_not_skipped() {
        let outcome = TurnOutcome::error_with("t".to_string(), None, "boom");
        assert!(!outcome.skipped);
        assert!(outcome.is_error);
        assert_eq!(
            outcome.response_text.as_deref(),
            Some("Error generating response: boom")
        );
    }

    #[tokio::test]
    async fn interrupt_room_only_clears_that_room() {
        let broadcaster = Arc::new(EventBroadcaster::new(SseConfig::default()));
        let manager = AgentManager::new(HashMap::new(), PoolConfig::default(), broadcaster);

        let (handle_a, mut rx_a) = InterruptHandle::new();
        let (handle_b, mut rx_b) = InterruptHandle::new();
        manager
            .register_turn(TaskId::new(RoomId(1), AgentId(1)), "temp_a", handle_a)
            .await;
        manager
            .register_turn(TaskId::new(RoomId(2), AgentId(1)), "temp_b", handle_b)
            .await;

        manager.interrupt_room(RoomId(1)).await;

        assert!(rx_a.try_recv().is_ok(), "room 1 agent interrupted");
        assert!(rx_b.try_recv().is_err(), "room 2 agent untouched");
        assert_eq!(manager.active.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn streaming_snapshot_filters_by_room() {
        let broadcaster = Arc::new(EventBroadcaster::new(SseConfig::default()));
        let manager = AgentManager::new(HashMap::new(), PoolConfig::default(), broadcaster);

        let (handle, _rx) = InterruptHandle::new();
        let task = TaskId::new(RoomId(1), AgentId(7));
        manager.register_turn(task, "temp_7", handle).await;
        manager
            .update_streaming(task, StreamingSnapshot {
                response_text: "Hel".to_string(),
                thinking_text: String::new(),
                skip_used: false,
            })
            .await;

        let snapshots = manager.streaming_snapshot_for_room(RoomId(1)).await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].0, AgentId(7));
        assert_eq!(snapshots[0].1.response_text, "Hel");

        assert!(manager.streaming_snapshot_for_room(RoomId(2)).await.is_empty());
    }
}
