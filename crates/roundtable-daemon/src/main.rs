//! Roundtable Daemon
//!
//! Orchestrates multi-agent chat rooms: runs turn tapes over backend
//! clients, streams partial output to SSE subscribers, and schedules
//! follow-up rounds for quiet rooms.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{info, warn};

use roundtable_core::config::{self, Config};
use roundtable_core::logging::init_tracing;

use roundtable_daemon::domain::BackendKind;
use roundtable_daemon::manager::AgentManager;
use roundtable_daemon::orchestration::{
    ContextTemplates, FollowUpScheduler, Orchestrator, ResponseGenerator,
};
use roundtable_daemon::providers::alpha::AlphaProvider;
use roundtable_daemon::providers::beta::{AppServerPool, BetaProvider};
use roundtable_daemon::providers::ProviderMap;
use roundtable_daemon::sse::EventBroadcaster;
use roundtable_daemon::storage::{SqliteStorage, Storage};

/// Budget for the whole shutdown sequence; past it the process force-exits.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "roundtable-daemon")]
#[command(version, about = "Roundtable daemon - multi-agent chat orchestration")]
struct Args {
    /// Database file path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Project directory holding .roundtable/settings.json
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Backend-A client binary
    #[arg(long, env = "ROUNDTABLE_ALPHA_COMMAND", default_value = "agent-client")]
    alpha_command: String,

    /// Backend-B app-server binary (overrides config)
    #[arg(long)]
    beta_command: Option<String>,

    /// Emit JSON log lines
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config: Config = config::load_config(args.project_dir.as_deref())?;
    if args.log_json {
        config.logging.json = true;
    }
    if let Some(beta_command) = &args.beta_command {
        config.app_server.command = beta_command.clone();
    }
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        alpha = %args.alpha_command,
        beta = %config.app_server.command,
        "Starting roundtable-daemon"
    );

    let db_path = args
        .db_path
        .or_else(|| config.storage.database_path.clone())
        .or_else(config::database_path)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine database path"))?;
    info!(path = %db_path.display(), "Opening database");
    let storage = SqliteStorage::open(&db_path).await?;
    let storage_handle: Arc<dyn Storage> = Arc::new(storage.clone());

    let broadcaster = Arc::new(EventBroadcaster::new(config.sse.clone()));
    let app_server_pool = AppServerPool::new(config.app_server.clone());

    let mut providers: ProviderMap = HashMap::new();
    providers.insert(
        BackendKind::Alpha,
        Arc::new(AlphaProvider::new(&args.alpha_command)),
    );
    providers.insert(
        BackendKind::Beta,
        Arc::new(BetaProvider::new(Arc::clone(&app_server_pool))),
    );
    for (kind, provider) in &providers {
        if !provider.check_availability().await {
            warn!(backend = %kind, "Backend binary not found; rooms on it will fail");
        }
    }

    let manager = Arc::new(AgentManager::new(
        providers,
        config.pool.clone(),
        Arc::clone(&broadcaster),
    ));

    let last_user_message_time = Arc::new(Mutex::new(HashMap::new()));
    let response_generator = Arc::new(ResponseGenerator::new(
        Arc::clone(&storage_handle),
        Arc::clone(&manager),
        ContextTemplates::default(),
        config.orchestrator.clone(),
        Arc::clone(&last_user_message_time),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&storage_handle),
        Arc::clone(&manager),
        response_generator,
        last_user_message_time,
        config.orchestrator.clone(),
    ));

    let mut scheduler = FollowUpScheduler::new(
        Arc::clone(&storage_handle),
        Arc::clone(&orchestrator),
        config.orchestrator.clone(),
    );
    scheduler.start();

    info!("Daemon running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let shutdown = async {
        scheduler.stop().await;
        manager.interrupt_all().await;
        broadcaster.shutdown().await;
        manager.shutdown().await;
        app_server_pool.shutdown().await;
        storage.close().await;
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, shutdown).await.is_err() {
        warn!("Shutdown budget exceeded, force-exiting");
        std::process::exit(1);
    }

    info!("Daemon stopped");
    Ok(())
}
