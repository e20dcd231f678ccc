//! Per-room subscriber fan-out with bounded queues and keep-alives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use roundtable_core::config::SseConfig;

use crate::domain::RoomId;

use super::RoomEvent;

/// Sender side of one subscriber's bounded queue.
struct Subscriber {
    client_id: String,
    tx: mpsc::Sender<RoomEvent>,
}

/// One subscriber's connection: the receiving end of its queue.
pub struct SseConnection {
    pub room_id: RoomId,
    pub client_id: String,
    rx: mpsc::Receiver<RoomEvent>,
}

impl SseConnection {
    pub async fn receive(&mut self) -> Option<RoomEvent> {
        self.rx.recv().await
    }
}

/// Manages SSE subscribers per room and broadcasts events.
///
/// The room map is behind an async lock because subscribe, unsubscribe and
/// broadcast all race.
pub struct EventBroadcaster {
    config: SseConfig,
    rooms: Mutex<HashMap<RoomId, Vec<Subscriber>>>,
}

impl EventBroadcaster {
    pub fn new(config: SseConfig) -> Self {
        Self {
            config,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.config.keepalive_interval_secs)
    }

    /// Subscribe a client to a room's event stream.
    pub async fn subscribe(&self, room_id: RoomId) -> SseConnection {
        let client_id = short_client_id();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));

        self.rooms
            .lock()
            .await
            .entry(room_id)
            .or_default()
            .push(Subscriber { client_id: client_id.clone(), tx });

        info!(room = %room_id, client_id, "SSE client subscribed");
        SseConnection { room_id, client_id, rx }
    }

    /// Remove a subscriber; empty rooms are dropped from the map.
    pub async fn unsubscribe(&self, room_id: RoomId, client_id: &str) {
        let mut rooms = self.rooms.lock().await;
        if let Some(subscribers) = rooms.get_mut(&room_id) {
            subscribers.retain(|s| s.client_id != client_id);
            if subscribers.is_empty() {
                rooms.remove(&room_id);
            }
        }
        info!(room = %room_id, client_id, "SSE client unsubscribed");
    }

    /// Broadcast an event to every subscriber of a room. Returns the number
    /// of deliveries; a full queue drops the event for that subscriber
    /// only.
    pub async fn broadcast(&self, room_id: RoomId, event: &RoomEvent) -> usize {
        // Snapshot under the lock, deliver outside it.
        let snapshot: Vec<(String, mpsc::Sender<RoomEvent>)> = {
            let mut rooms = self.rooms.lock().await;
            let Some(subscribers) = rooms.get_mut(&room_id) else {
                return 0;
            };
            subscribers.retain(|s| !s.tx.is_closed());
            subscribers
                .iter()
                .map(|s| (s.client_id.clone(), s.tx.clone()))
                .collect()
        };

        let mut sent = 0;
        for (client_id, tx) in snapshot {
            match tx.try_send(event.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(room = %room_id, client_id, "SSE queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        if sent > 0 {
            debug!(room = %room_id, receivers = sent, "Event broadcast");
        }
        sent
    }

    pub async fn connection_count(&self, room_id: RoomId) -> usize {
        self.rooms
            .lock()
            .await
            .get(&room_id)
            .map_or(0, Vec::len)
    }

    /// Enqueue a shutdown sentinel on every queue and clear the map.
    pub async fn shutdown(&self) {
        let mut rooms = self.rooms.lock().await;
        let total: usize = rooms.values().map(Vec::len).sum();
        if total > 0 {
            info!(connections = total, "Closing SSE connections");
            for subscribers in rooms.values() {
                for subscriber in subscribers {
                    // Best effort.
                    let _ = subscriber.tx.try_send(RoomEvent::Shutdown);
                }
            }
        }
        rooms.clear();
        info!("Event broadcaster shutdown complete");
    }
}

/// Unsubscribes the connection when the consuming stream is dropped.
struct UnsubscribeGuard {
    broadcaster: Arc<EventBroadcaster>,
    room_id: RoomId,
    client_id: String,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let broadcaster = Arc::clone(&self.broadcaster);
        let room_id = self.room_id;
        let client_id = std::mem::take(&mut self.client_id);
        handle.spawn(async move {
            broadcaster.unsubscribe(room_id, &client_id).await;
        });
    }
}

/// Event stream for one connection: queue events interleaved with
/// keep-alives, terminated by the shutdown sentinel. The connection is
/// unsubscribed when the stream is dropped, including on cancellation.
pub fn event_stream(
    broadcaster: Arc<EventBroadcaster>,
    mut connection: SseConnection,
) -> impl Stream<Item = RoomEvent> {
    let keepalive = broadcaster.keepalive_interval();
    let guard = UnsubscribeGuard {
        broadcaster,
        room_id: connection.room_id,
        client_id: connection.client_id.clone(),
    };

    async_stream::stream! {
        let _guard = guard;
        loop {
            match tokio::time::timeout(keepalive, connection.receive()).await {
                Ok(Some(RoomEvent::Shutdown)) => {
                    debug!(client_id = %connection.client_id, "SSE shutdown received");
                    return;
                }
                Ok(Some(event)) => yield event,
                Ok(None) => return,
                Err(_) => {
                    yield RoomEvent::Keepalive { timestamp: chrono::Utc::now().timestamp_millis() };
                }
            }
        }
    }
}

fn short_client_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
