//! Single backend-B app-server instance.
//!
//! One subprocess per agent, JSON-RPC over stdio. A single request lock
//! serializes turns: the backend allows one outstanding turn per process,
//! so follow-up messages on the same thread queue behind each other.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tracing::{debug, info, warn};

use roundtable_core::stream::beta::{self, BetaEvent};

use crate::providers::BackendError;

use super::transport::JsonRpcTransport;

/// Launch-time configuration for one app-server subprocess.
#[derive(Debug, Clone)]
pub struct StartupConfig {
    /// Binary name, e.g. `codex`.
    pub command: String,
    /// Features passed as `--disable <name>`.
    pub disabled_features: Vec<String>,
    /// Overrides passed as `-c key=value`, including the agent's baked-in
    /// tool-server definitions.
    pub overrides: Vec<String>,
    /// Extra environment for the subprocess and its tool servers.
    pub env: Vec<(String, String)>,
    /// JSON-RPC request timeout.
    pub request_timeout: Duration,
}

impl StartupConfig {
    /// Full command line: `<command> app-server --disable f... -c k=v...`.
    pub fn to_command(&self) -> Vec<String> {
        let mut command = vec![self.command.clone(), "app-server".to_string()];
        for feature in &self.disabled_features {
            command.push("--disable".to_string());
            command.push(feature.clone());
        }
        for kv in &self.overrides {
            command.push("-c".to_string());
            command.push(kv.clone());
        }
        command
    }
}

/// Per-turn configuration sent at `thread/start` and `turn/start`.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub cwd: String,
    pub model: Option<String>,
    pub base_instructions: String,
    pub sandbox: String,
    pub approval_policy: String,
}

/// A running turn: events stream out of `events`; the request-lock guard
/// rides along so the next turn on this instance waits for this one.
pub struct TurnHandle {
    pub events: mpsc::UnboundedReceiver<BetaEvent>,
    _lock: OwnedMutexGuard<()>,
}

/// Shared turn routing state between the instance and its dispatch task.
#[derive(Default)]
struct TurnRouting {
    active_tx: Option<mpsc::UnboundedSender<BetaEvent>>,
    current_turn_id: Option<String>,
    current_thread_id: Option<String>,
}

/// One backend-B app-server subprocess.
pub struct AppServerInstance {
    instance_id: u64,
    agent_key: String,
    transport: JsonRpcTransport,
    request_timeout: Duration,
    /// One turn in flight at a time.
    request_lock: Arc<Mutex<()>>,
    routing: Arc<StdMutex<TurnRouting>>,
    active_threads: StdMutex<HashSet<String>>,
    last_activity: StdMutex<Instant>,
}

impl AppServerInstance {
    /// Spawn the subprocess and perform the initialize handshake.
    pub async fn start(
        instance_id: u64,
        agent_key: String,
        config: &StartupConfig,
    ) -> Result<Self, BackendError> {
        let (notification_tx, mut notification_rx) = mpsc::unbounded_channel::<Value>();
        let transport =
            JsonRpcTransport::start(&config.to_command(), &config.env, notification_tx, instance_id)
                .await?;

        let routing: Arc<StdMutex<TurnRouting>> = Arc::new(StdMutex::new(TurnRouting::default()));

        // Dispatch task: convert raw notifications to canonical events and
        // route them to the active turn.
        let routing_for_dispatch = Arc::clone(&routing);
        tokio::spawn(async move {
            while let Some(raw) = notification_rx.recv().await {
                let event = match raw.get("method").and_then(Value::as_str) {
                    Some(method) => {
                        let params = raw.get("params").cloned().unwrap_or(Value::Null);
                        beta::parse_notification(method, &params)
                    }
                    None => beta::parse_event(&raw),
                };
                route_event(&routing_for_dispatch, event);
            }
        });

        let instance = Self {
            instance_id,
            agent_key,
            transport,
            request_timeout: config.request_timeout,
            request_lock: Arc::new(Mutex::new(())),
            routing,
            active_threads: StdMutex::new(HashSet::new()),
            last_activity: StdMutex::new(Instant::now()),
        };

        instance
            .transport
            .send_request(
                "initialize",
                json!({"clientInfo": {"name": "roundtable", "version": env!("CARGO_PKG_VERSION")}}),
                instance.request_timeout,
            )
            .await?;

        info!(instance_id, agent_key = %instance.agent_key, "App-server instance started");
        Ok(instance)
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn agent_key(&self) -> &str {
        &self.agent_key
    }

    pub fn is_healthy(&self) -> bool {
        self.transport.is_healthy()
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_duration(&self) -> Duration {
        self.last_activity
            .lock()
            .map_or(Duration::ZERO, |last| last.elapsed())
    }

    pub fn owns_thread(&self, thread_id: &str) -> bool {
        self.active_threads
            .lock()
            .is_ok_and(|threads| threads.contains(thread_id))
    }

    fn track_thread(&self, thread_id: &str) {
        if let Ok(mut threads) = self.active_threads.lock() {
            threads.insert(thread_id.to_string());
        }
    }

    /// Create a new thread; returns its id.
    pub async fn start_thread(&self, config: &TurnConfig) -> Result<String, BackendError> {
        self.touch();
        let mut params = json!({
            "cwd": config.cwd,
            "baseInstructions": config.base_instructions,
            "sandbox": config.sandbox,
            "approvalPolicy": config.approval_policy,
        });
        if let Some(model) = &config.model {
            params["model"] = json!(model);
        }

        let result = self
            .transport
            .send_request("thread/start", params, self.request_timeout)
            .await?;

        let thread_id = result
            .get("threadId")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Protocol("thread/start returned no threadId".into()))?
            .to_string();

        self.track_thread(&thread_id);
        debug!(instance_id = self.instance_id, thread_id, "Thread started");
        Ok(thread_id)
    }

    /// Resume a persisted thread on this instance.
    ///
    /// An unknown thread id surfaces as [`BackendError::SessionRecovery`]
    /// so the response generator can replay full history under a fresh
    /// thread.
    pub async fn resume_thread(&self, thread_id: &str, cwd: &str) -> Result<(), BackendError> {
        self.touch();
        let result = self
            .transport
            .send_request(
                "thread/resume",
                json!({"threadId": thread_id, "cwd": cwd}),
                self.request_timeout,
            )
            .await;

        match result {
            Ok(_) => {
                self.track_thread(thread_id);
                info!(instance_id = self.instance_id, thread_id, "Thread resumed");
                Ok(())
            }
            Err(BackendError::Protocol(message))
                if message.to_lowercase().contains("not found")
                    || message.to_lowercase().contains("session not found") =>
            {
                Err(BackendError::SessionRecovery {
                    old_thread_id: thread_id.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Start a turn on a thread. Events stream from the returned handle;
    /// the per-instance request lock is held until the handle drops.
    pub async fn run_turn(
        &self,
        thread_id: &str,
        input: Vec<Value>,
        config: &TurnConfig,
    ) -> Result<TurnHandle, BackendError> {
        let lock = Arc::clone(&self.request_lock).lock_owned().await;
        self.touch();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Ok(mut routing) = self.routing.lock() {
            routing.active_tx = Some(events_tx);
            routing.current_turn_id = None;
            routing.current_thread_id = Some(thread_id.to_string());
        }

        let mut params = json!({
            "threadId": thread_id,
            "input": input,
            "baseInstructions": config.base_instructions,
        });
        if let Some(model) = &config.model {
            params["model"] = json!(model);
        }

        self.transport
            .send_request_no_wait("turn/start", params)
            .await?;

        Ok(TurnHandle { events: events_rx, _lock: lock })
    }

    /// Interrupt the turn currently in flight, if any.
    pub async fn interrupt_current_turn(&self) -> Result<(), BackendError> {
        let (thread_id, turn_id) = match self.routing.lock() {
            Ok(routing) => (
                routing.current_thread_id.clone(),
                routing.current_turn_id.clone(),
            ),
            Err(_) => (None, None),
        };
        let (Some(thread_id), Some(turn_id)) = (thread_id, turn_id) else {
            debug!(instance_id = self.instance_id, "No turn in flight to interrupt");
            return Ok(());
        };

        self.transport
            .send_notification("turn/interrupt", json!({"threadId": thread_id, "turnId": turn_id}))
            .await
    }

    pub async fn shutdown(&self) {
        if let Ok(mut routing) = self.routing.lock() {
            routing.active_tx = None;
        }
        self.transport.shutdown().await;
    }

    pub fn kill(&self) {
        self.transport.kill();
    }
}

/// Route one canonical event into the active turn channel, tracking the
/// in-flight turn id for interrupts.
fn route_event(routing: &Arc<StdMutex<TurnRouting>>, event: BetaEvent) {
    let Ok(mut routing) = routing.lock() else { return };

    if let BetaEvent::TurnStarted { turn_id } = &event {
        routing.current_turn_id = Some(turn_id.clone());
    }
    let terminal = matches!(event, BetaEvent::TurnCompleted { .. });

    if let Some(tx) = &routing.active_tx {
        if tx.send(event).is_err() {
            routing.active_tx = None;
        }
    } else {
        warn!("Dropping app-server event with no active turn");
    }

    if terminal {
        routing.active_tx = None;
        routing.current_turn_id = None;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn startup_config_builds_command_line() {
        let config = StartupConfig {
            command: "codex".to_string(),
            disabled_features: vec!["web_search".to_string()],
            overrides: vec!["mcp_servers.social.command=social-server".to_string()],
            env: Vec::new(),
            request_timeout: Duration::from_secs(30),
        };
        assert_eq!(
            config.to_command(),
            vec![
                "codex",
                "app-server",
                "--disable",
                "web_search",
                "-c",
                "mcp_servers.social.command=social-server",
            ]
        );
    }

    #[test]
    fn route_event_tracks_turn_id_and_terminal() {
        let routing: Arc<StdMutex<TurnRouting>> = Arc::new(StdMutex::new(TurnRouting::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        routing.lock().unwrap().active_tx = Some(tx);

        route_event(&routing, BetaEvent::TurnStarted { turn_id: "t-1".to_string() });
        assert_eq!(
            routing.lock().unwrap().current_turn_id.as_deref(),
            Some("t-1")
        );

        route_event(
            &routing,
            BetaEvent::TurnCompleted {
                status: roundtable_core::stream::beta::TurnStatus::Completed,
                error: None,
            },
        );
        // Terminal event clears the routing slot.
        assert!(routing.lock().unwrap().active_tx.is_none());
        assert!(routing.lock().unwrap().current_turn_id.is_none());

        assert!(matches!(rx.try_recv(), Ok(BetaEvent::TurnStarted { .. })));
        assert!(matches!(rx.try_recv(), Ok(BetaEvent::TurnCompleted { .. })));
    }
}
