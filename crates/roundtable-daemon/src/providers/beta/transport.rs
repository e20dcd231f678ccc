//! JSON-RPC 2.0 transport over a subprocess's stdio.
//!
//! Owns the subprocess and exchanges line-delimited JSON-RPC messages.
//! The stdout reader buffers manually in 1 MiB chunks: turn payloads can
//! carry base64 images well past the 64 KiB default of line readers.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::providers::BackendError;

/// Grace period between SIGTERM and SIGKILL on shutdown.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stdout read chunk size.
const CHUNK_SIZE: usize = 1024 * 1024;

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// Low-level JSON-RPC transport over subprocess stdin/stdout.
///
/// All methods take `&self`; lifecycle state lives behind locks so a pooled
/// instance can be shut down while clients still hold references.
pub struct JsonRpcTransport {
    instance_id: u64,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    pending: PendingMap,
    next_request_id: AtomicU64,
    healthy: Arc<AtomicBool>,
    started: AtomicBool,
}

impl JsonRpcTransport {
    /// Spawn the subprocess and begin reading stdout. Messages that are not
    /// responses to pending requests are forwarded on `notification_tx`.
    pub async fn start(
        command: &[String],
        env: &[(String, String)],
        notification_tx: mpsc::UnboundedSender<Value>,
        instance_id: u64,
    ) -> Result<Self, BackendError> {
        let Some((program, args)) = command.split_first() else {
            return Err(BackendError::Transport("empty command".to_string()));
        };

        info!(instance_id, command = %command.join(" "), "Starting app-server transport");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Transport(format!("spawn failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Transport("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Transport("Failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let id = instance_id;
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let reader = tokio::io::BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(instance_id = id, "app-server stderr: {}", line);
                }
            });
        }

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let healthy = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_stdout(
            stdout,
            Arc::clone(&pending),
            notification_tx,
            Arc::clone(&healthy),
            instance_id,
        ));

        info!(instance_id, pid = ?child.id(), "Transport started");

        Ok(Self {
            instance_id,
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            reader_task: StdMutex::new(Some(reader_task)),
            pending,
            next_request_id: AtomicU64::new(0),
            healthy,
            started: AtomicBool::new(true),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.healthy.load(Ordering::SeqCst)
    }

    /// Send a request and wait for the matching response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BackendError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_id, tx);
        }

        let message = json!({"method": method, "params": params, "id": request_id});
        if let Err(e) = self.write_message(&message).await {
            self.remove_pending(request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(rpc_error))) => Err(BackendError::Protocol(format!(
                "RPC error from {method}: {rpc_error}"
            ))),
            Ok(Err(_)) => Err(BackendError::Transport(format!(
                "transport closed while waiting for {method}"
            ))),
            Err(_) => {
                self.remove_pending(request_id);
                Err(BackendError::Timeout(timeout))
            }
        }
    }

    /// Send a request whose answer arrives via notifications; returns the
    /// request id.
    pub async fn send_request_no_wait(
        &self,
        method: &str,
        params: Value,
    ) -> Result<u64, BackendError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let message = json!({"method": method, "params": params, "id": request_id});
        self.write_message(&message).await?;
        Ok(request_id)
    }

    /// Send a notification (no id, no response expected).
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), BackendError> {
        let message = json!({"method": method, "params": params});
        self.write_message(&message).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), BackendError> {
        let mut line = message.to_string();
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            self.healthy.store(false, Ordering::SeqCst);
            return Err(BackendError::Transport("process not started".to_string()));
        };
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            self.healthy.store(false, Ordering::SeqCst);
            return Err(BackendError::Transport(format!(
                "failed to write to process: {e}"
            )));
        }
        debug!(instance_id = self.instance_id, "Sent: {}", line.trim());
        Ok(())
    }

    fn remove_pending(&self, request_id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&request_id);
        }
    }

    /// Gracefully shut down: cancel the reader, SIGTERM with a bounded
    /// wait, then SIGKILL; all pending request futures are cancelled.
    pub async fn shutdown(&self) {
        info!(instance_id = self.instance_id, "Shutting down transport");

        let reader = self.reader_task.lock().ok().and_then(|mut r| r.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        *self.stdin.lock().await = None;

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                // SAFETY: pid is our own child's; SIGTERM on an owned
                // subprocess is safe.
                #[allow(unsafe_code)]
                #[allow(clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    warn!(pid, error = %err, "Failed to send SIGTERM");
                }
            }

            match tokio::time::timeout(TERMINATE_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(?status, "app-server exited"),
                Ok(Err(e)) => {
                    warn!(error = %e, "Error waiting for app-server");
                    child.kill().await.ok();
                }
                Err(_) => {
                    warn!("Grace period expired, killing app-server");
                    child.kill().await.ok();
                }
            }
        }

        // Cancel pending request futures.
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }

        self.healthy.store(false, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        info!(instance_id = self.instance_id, "Transport shutdown complete");
    }

    /// Forcefully kill the subprocess (emergency cleanup).
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                child.start_kill().ok();
            }
        }
        self.healthy.store(false, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
    }
}

/// Read stdout in chunks, split on newlines, classify each message.
async fn read_stdout(
    mut stdout: tokio::process::ChildStdout,
    pending: PendingMap,
    notification_tx: mpsc::UnboundedSender<Value>,
    healthy: Arc<AtomicBool>,
    instance_id: u64,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => {
                warn!(instance_id, "app-server stdout closed");
                healthy.store(false, Ordering::SeqCst);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!(instance_id, error = %e, "app-server stdout read error");
                healthy.store(false, Ordering::SeqCst);
                break;
            }
        };
        buffer.extend_from_slice(&chunk[..n]);

        // Process complete lines.
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(message) => handle_message(message, &pending, &notification_tx, instance_id),
                Err(e) => warn!(instance_id, error = %e, "Invalid JSON from app-server"),
            }
        }
    }
}

/// Three-way classification: response, server-initiated request, or
/// notification.
fn handle_message(
    message: Value,
    pending: &PendingMap,
    notification_tx: &mpsc::UnboundedSender<Value>,
    instance_id: u64,
) {
    let has_id = message.get("id").is_some();
    let is_response = has_id && (message.get("result").is_some() || message.get("error").is_some());

    if is_response {
        let Some(request_id) = message.get("id").and_then(Value::as_u64) else {
            warn!(instance_id, "Response with non-numeric id");
            return;
        };
        let sender = pending.lock().ok().and_then(|mut p| p.remove(&request_id));
        if let Some(sender) = sender {
            let outcome = match message.get("error") {
                Some(error) => Err(error.to_string()),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = sender.send(outcome);
        } else {
            debug!(instance_id, request_id, "Response for unknown request");
        }
        return;
    }

    if has_id && message.get("method").is_some() {
        // Server-initiated request: not part of the contract.
        warn!(
            instance_id,
            method = message.get("method").and_then(|v| v.as_str()).unwrap_or(""),
            "Dropping unexpected server-initiated request"
        );
        return;
    }

    if message.get("method").is_some() || message.get("type").is_some() {
        let _ = notification_tx.send(message);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pending_with(id: u64) -> (PendingMap, oneshot::Receiver<Result<Value, String>>) {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(id, tx);
        (pending, rx)
    }

    #[tokio::test]
    async fn response_resolves_pending_future() {
        let (pending, rx) = pending_with(1);
        let (notif_tx, _notif_rx) = mpsc::unbounded_channel();

        handle_message(
            json!({"id": 1, "result": {"threadId": "T1"}}),
            &pending,
            &notif_tx,
            0,
        );

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["threadId"], "T1");
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_response_resolves_with_error() {
        let (pending, rx) = pending_with(2);
        let (notif_tx, _notif_rx) = mpsc::unbounded_channel();

        handle_message(
            json!({"id": 2, "error": {"message": "session not found"}}),
            &pending,
            &notif_tx,
            0,
        );

        let result = rx.await.unwrap();
        assert!(result.unwrap_err().contains("session not found"));
    }

    #[tokio::test]
    async fn notification_routes_to_channel() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (notif_tx, mut notif_rx) = mpsc::unbounded_channel();

        handle_message(
            json!({"method": "item/agentMessage/delta", "params": {"delta": "hi"}}),
            &pending,
            &notif_tx,
            0,
        );

        let received = notif_rx.recv().await.unwrap();
        assert_eq!(received["method"], "item/agentMessage/delta");
    }

    #[tokio::test]
    async fn server_initiated_request_is_dropped() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (notif_tx, mut notif_rx) = mpsc::unbounded_channel();

        handle_message(
            json!({"id": 7, "method": "client/ping", "params": {}}),
            &pending,
            &notif_tx,
            0,
        );

        assert!(notif_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typed_event_without_method_is_a_notification() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (notif_tx, mut notif_rx) = mpsc::unbounded_channel();

        handle_message(
            json!({"type": "response_item", "payload": {"role": "assistant"}}),
            &pending,
            &notif_tx,
            0,
        );

        assert!(notif_rx.try_recv().is_ok());
    }
}
