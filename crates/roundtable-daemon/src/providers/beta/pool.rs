//! Backend-B app-server pool.
//!
//! One subprocess per agent, created lazily, capped at `max_instances`
//! with most-idle eviction, reaped by a background sweeper after
//! `idle_timeout` of inactivity. Threads survive instance restarts via the
//! [`ThreadRegistry`] and the persisted thread id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use roundtable_core::config::AppServerConfig;

use crate::providers::BackendError;

use super::instance::{AppServerInstance, StartupConfig};
use super::threads::ThreadRegistry;

/// Total budget for shutting down all instances.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// Pool of per-agent app-server instances.
pub struct AppServerPool {
    config: AppServerConfig,
    instances: Mutex<HashMap<String, Arc<AppServerInstance>>>,
    threads: ThreadRegistry,
    instance_counter: Mutex<u64>,
    shutdown_tx: watch::Sender<bool>,
}

impl AppServerPool {
    /// Create the pool and start its idle sweeper.
    pub fn new(config: AppServerConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(Self {
            config,
            instances: Mutex::new(HashMap::new()),
            threads: ThreadRegistry::new(),
            instance_counter: Mutex::new(0),
            shutdown_tx,
        });
        pool.clone().start_sweeper(shutdown_rx);
        pool
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn config(&self) -> &AppServerConfig {
        &self.config
    }

    fn start_sweeper(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.cleanup_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        self.reap_idle_instances().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("App-server sweeper stopped");
        });
    }

    async fn reap_idle_instances(&self) {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let mut reaped = Vec::new();
        {
            let mut instances = self.instances.lock().await;
            let idle_keys: Vec<String> = instances
                .iter()
                .filter(|(_, instance)| instance.idle_duration() > idle_timeout)
                .map(|(key, _)| key.clone())
                .collect();
            for key in idle_keys {
                if let Some(instance) = instances.remove(&key) {
                    info!(
                        agent_key = %key,
                        idle_secs = instance.idle_duration().as_secs(),
                        "Reaping idle app-server instance"
                    );
                    reaped.push(instance);
                }
            }
        }
        for instance in reaped {
            self.threads.clear_instance(instance.instance_id());
            instance.shutdown().await;
        }
    }

    /// Evict the most idle instance when at capacity. Caller holds the
    /// instances lock.
    async fn evict_if_needed(
        &self,
        instances: &mut HashMap<String, Arc<AppServerInstance>>,
    ) -> Option<Arc<AppServerInstance>> {
        if instances.len() < self.config.max_instances {
            return None;
        }
        let most_idle = instances
            .iter()
            .max_by_key(|(_, instance)| instance.idle_duration())
            .map(|(key, _)| key.clone())?;
        let instance = instances.remove(&most_idle)?;
        info!(
            agent_key = %most_idle,
            idle_secs = instance.idle_duration().as_secs(),
            "Evicting app-server instance to make room"
        );
        Some(instance)
    }

    /// Get a healthy instance for the agent, creating (and possibly
    /// evicting) as needed.
    pub async fn get_or_create_instance(
        &self,
        agent_key: &str,
        startup: &StartupConfig,
    ) -> Result<Arc<AppServerInstance>, BackendError> {
        let evicted;
        let started;
        {
            let mut instances = self.instances.lock().await;

            if let Some(instance) = instances.get(agent_key) {
                if instance.is_healthy() {
                    instance.touch();
                    return Ok(Arc::clone(instance));
                }
                warn!(agent_key, "App-server instance unhealthy, recreating");
                let stale = instances.remove(agent_key);
                if let Some(stale) = stale {
                    self.threads.clear_instance(stale.instance_id());
                    stale.shutdown().await;
                }
            }

            evicted = self.evict_if_needed(&mut instances).await;

            let instance_id = {
                let mut counter = self.instance_counter.lock().await;
                *counter += 1;
                *counter
            };
            started = AppServerInstance::start(instance_id, agent_key.to_string(), startup)
                .await
                .map(Arc::new);
            if let Ok(instance) = &started {
                instances.insert(agent_key.to_string(), Arc::clone(instance));
            }
        }

        // The evicted instance is torn down outside the map lock whether or
        // not the replacement came up; a failed spawn must not orphan its
        // subprocess or leave its threads pinned.
        if let Some(evicted) = evicted {
            self.threads.clear_instance(evicted.instance_id());
            evicted.shutdown().await;
        }
        started
    }

    /// The instance owning a thread, if it is still alive.
    pub async fn instance_for_thread(&self, thread_id: &str) -> Option<Arc<AppServerInstance>> {
        let (agent_key, _) = self.threads.owner_of(thread_id);
        let agent_key = agent_key?;
        self.instances.lock().await.get(&agent_key).cloned()
    }

    pub async fn active_instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// Shut down the sweeper and every instance within a bounded budget;
    /// force-kill whatever is left.
    pub async fn shutdown(&self) {
        info!("Shutting down app-server pool");
        let _ = self.shutdown_tx.send(true);

        let instances: Vec<Arc<AppServerInstance>> =
            self.instances.lock().await.drain().map(|(_, v)| v).collect();

        let all_shutdown = async {
            for instance in &instances {
                instance.shutdown().await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_BUDGET, all_shutdown).await.is_err() {
            warn!("App-server shutdown timed out, forcing kill");
            for instance in &instances {
                instance.kill();
            }
        }

        self.threads.clear_all();
        info!("App-server pool shutdown complete");
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_pool(max_instances: usize) -> Arc<AppServerPool> {
        AppServerPool::new(AppServerConfig {
            max_instances,
            idle_timeout_secs: 600,
            cleanup_interval_secs: 3600,
            request_timeout_secs: 5,
            command: "definitely-not-a-real-binary".to_string(),
            disabled_features: Vec::new(),
            overrides: Vec::new(),
        })
    }

    #[tokio::test]
    async fn pool_starts_empty() {
        let pool = test_pool(2);
        assert_eq!(pool.active_instance_count().await, 0);
    }

    #[tokio::test]
    async fn create_fails_cleanly_when_binary_missing() {
        let pool = test_pool(2);
        let startup = StartupConfig {
            command: "definitely-not-a-real-binary".to_string(),
            disabled_features: Vec::new(),
            overrides: Vec::new(),
            env: Vec::new(),
            request_timeout: Duration::from_secs(1),
        };
        let result = pool.get_or_create_instance("room-1-agent-1", &startup).await;
        assert!(result.is_err());
        assert_eq!(pool.active_instance_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_clears_thread_registry() {
        let pool = test_pool(2);
        pool.threads().register("T1", "room-1-agent-1", Some(1));
        pool.shutdown().await;
        assert_eq!(pool.threads().thread_count(), 0);
    }
}
