//! Background follow-up scheduler.
//!
//! Periodically picks rooms that have gone quiet and are under their
//! follow-up ceiling, then runs one follow-up round per room. Room
//! concurrency is bounded by a semaphore so a busy process does not fan
//! out across every room at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use roundtable_core::config::OrchestratorConfig;

use crate::storage::{Storage, unix_millis};

use super::orchestrator::Orchestrator;

/// Grace period for the scheduler task to finish on shutdown.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Periodic driver of follow-up rounds.
pub struct FollowUpScheduler {
    storage: Arc<dyn Storage>,
    orchestrator: Arc<Orchestrator>,
    config: OrchestratorConfig,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl FollowUpScheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        orchestrator: Arc<Orchestrator>,
        config: OrchestratorConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            storage,
            orchestrator,
            config,
            shutdown_tx,
            task: None,
        }
    }

    /// Start the periodic tick task.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let storage = Arc::clone(&self.storage);
        let orchestrator = Arc::clone(&self.orchestrator);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs(config.scheduler_interval_secs);

        info!(
            interval_secs = config.scheduler_interval_secs,
            max_concurrent_rooms = config.max_concurrent_rooms,
            "Starting follow-up scheduler"
        );

        self.task = Some(tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(config.max_concurrent_rooms.max(1)));
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        run_tick(&storage, &orchestrator, &config, &semaphore).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Follow-up scheduler stopped");
        }));
    }

    /// Stop the scheduler with a bounded grace period.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                warn!("Scheduler did not stop within grace period");
            }
        }
    }
}

/// One scheduler tick: pick idle rooms under their ceiling and run one
/// follow-up round each, bounded by the room semaphore.
async fn run_tick(
    storage: &Arc<dyn Storage>,
    orchestrator: &Arc<Orchestrator>,
    config: &OrchestratorConfig,
    semaphore: &Arc<Semaphore>,
) {
    let rooms = match storage.list_active_rooms().await {
        Ok(rooms) => rooms,
        Err(e) => {
            warn!(error = %e, "Scheduler could not list rooms");
            return;
        }
    };

    let idle_cutoff = unix_millis() - (config.idle_threshold_secs as i64) * 1000;
    let mut rounds = JoinSet::new();

    for room in rooms {
        if room.last_activity_at > idle_cutoff {
            continue;
        }
        if room.follow_up_rounds_done >= room.max_follow_up_rounds {
            continue;
        }

        let semaphore = Arc::clone(semaphore);
        let orchestrator = Arc::clone(orchestrator);
        rounds.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            debug!(room = %room.id, "Running scheduled follow-up round");
            if let Err(e) = orchestrator.run_follow_up_round(room.id).await {
                warn!(room = %room.id, error = %e, "Scheduled round failed");
            }
        });
    }

    while rounds.join_next().await.is_some() {}
}
