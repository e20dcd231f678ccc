//! Centralized thread ownership tracking for backend-B.
//!
//! Threads outlive app-server instances: an instance can be reaped while
//! its threads remain resumable via the persisted thread id. The registry
//! keeps thread -> (agent key, instance id) maps so the pool can find or
//! rebuild the owning instance.
//!
//! Methods are synchronous: plain mutex over two maps, no await points.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

#[derive(Default)]
struct Maps {
    thread_to_agent: HashMap<String, String>,
    thread_to_instance: HashMap<String, u64>,
}

/// Thread lifecycle registry shared by the app-server pool.
#[derive(Default)]
pub struct ThreadRegistry {
    maps: Mutex<Maps>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread owned by `agent_key`, optionally pinned to the
    /// instance that created it.
    pub fn register(&self, thread_id: &str, agent_key: &str, instance_id: Option<u64>) {
        let Ok(mut maps) = self.maps.lock() else { return };
        maps.thread_to_agent
            .insert(thread_id.to_string(), agent_key.to_string());
        if let Some(instance_id) = instance_id {
            maps.thread_to_instance
                .insert(thread_id.to_string(), instance_id);
        }
        debug!(thread_id, agent_key, ?instance_id, "Registered thread");
    }

    /// Owning agent and instance, either may be absent.
    pub fn owner_of(&self, thread_id: &str) -> (Option<String>, Option<u64>) {
        match self.maps.lock() {
            Ok(maps) => (
                maps.thread_to_agent.get(thread_id).cloned(),
                maps.thread_to_instance.get(thread_id).copied(),
            ),
            Err(_) => (None, None),
        }
    }

    /// Drop a thread from tracking. Returns true when it was known.
    pub fn release(&self, thread_id: &str) -> bool {
        let Ok(mut maps) = self.maps.lock() else {
            return false;
        };
        maps.thread_to_instance.remove(thread_id);
        maps.thread_to_agent.remove(thread_id).is_some()
    }

    /// Unpin all threads from a reaped instance. The agent mapping stays so
    /// threads can be resumed on a fresh instance.
    pub fn clear_instance(&self, instance_id: u64) -> Vec<String> {
        let Ok(mut maps) = self.maps.lock() else {
            return Vec::new();
        };
        let cleared: Vec<String> = maps
            .thread_to_instance
            .iter()
            .filter(|&(_, &id)| id == instance_id)
            .map(|(thread_id, _)| thread_id.clone())
            .collect();
        for thread_id in &cleared {
            maps.thread_to_instance.remove(thread_id);
        }
        if !cleared.is_empty() {
            debug!(instance_id, count = cleared.len(), "Cleared instance threads");
        }
        cleared
    }

    pub fn clear_all(&self) {
        if let Ok(mut maps) = self.maps.lock() {
            maps.thread_to_agent.clear();
            maps.thread_to_instance.clear();
        }
    }

    pub fn thread_count(&self) -> usize {
        self.maps.lock().map_or(0, |maps| maps.thread_to_agent.len())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn register_and_look_up_owner() {
        let registry = ThreadRegistry::new();
        registry.register("T1", "room-1-agent-2", Some(3));
        assert_eq!(
            registry.owner_of("T1"),
            (Some("room-1-agent-2".to_string()), Some(3))
        );
    }

    #[test]
    fn clear_instance_keeps_agent_mapping() {
        let registry = ThreadRegistry::new();
        registry.register("T1", "room-1-agent-2", Some(3));
        registry.register("T2", "room-1-agent-5", Some(4));

        let cleared = registry.clear_instance(3);
        assert_eq!(cleared, vec!["T1".to_string()]);

        // Agent mapping survives so the thread remains resumable.
        assert_eq!(
            registry.owner_of("T1"),
            (Some("room-1-agent-2".to_string()), None)
        );
        assert_eq!(registry.owner_of("T2").1, Some(4));
    }

    #[test]
    fn release_removes_thread() {
        let registry = ThreadRegistry::new();
        registry.register("T1", "a", None);
        assert!(registry.release("T1"));
        assert!(!registry.release("T1"));
        assert_eq!(registry.thread_count(), 0);
    }
}
