//! Configuration resolution for Roundtable.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/roundtable/settings.json)
//! 3. Project config (.roundtable/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Roundtable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub app_server: AppServerConfig,
    #[serde(default)]
    pub sse: SseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration consumed by `logging::init_tracing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter applied when `RUST_LOG` is not set. Covers both crates so a
    /// bare daemon start logs orchestration and parsing alike.
    pub default_filter: String,
    /// Emit structured JSON log lines instead of the human-readable
    /// format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "roundtable_daemon=info,roundtable_core=info".to_string(),
            json: false,
        }
    }
}

/// Round-driving configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Default ceiling on orchestrator-initiated follow-up rounds per room.
    pub max_follow_up_rounds: u32,
    /// Concurrent rooms driven by the background scheduler.
    pub max_concurrent_rooms: usize,
    /// Message window used when an agent has no prior response in the room.
    pub context_message_limit: usize,
    /// Upper bound on messages fetched per turn.
    pub history_fetch_limit: usize,
    /// Probability of the rare-thought special instruction.
    pub rare_thought_probability: f64,
    /// Upper bound of the uncommon-thought roll (rare bound..this).
    pub uncommon_thought_probability: f64,
    /// Background scheduler tick interval in seconds.
    pub scheduler_interval_secs: u64,
    /// Room idle time before a follow-up round is considered, in seconds.
    pub idle_threshold_secs: u64,
    /// Include persisted skipped rows when replaying history for session
    /// recovery.
    pub include_skipped_in_recovery: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_follow_up_rounds: 5,
            max_concurrent_rooms: 3,
            context_message_limit: 25,
            history_fetch_limit: 120,
            rare_thought_probability: 0.05,
            uncommon_thought_probability: 0.20,
            scheduler_interval_secs: 30,
            idle_threshold_secs: 120,
            include_skipped_in_recovery: false,
        }
    }
}

/// Client pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Process-wide cap on concurrent backend connection creation.
    pub max_concurrent_connections: usize,
    /// Stabilization delay after each connection, in milliseconds.
    pub connection_stabilization_delay_ms: u64,
    /// Timeout for background disconnect operations, in seconds.
    pub disconnect_timeout_secs: u64,
    /// Connection attempts before surfacing a transport error.
    pub connect_retries: u32,
    /// Base delay for exponential connect backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 10,
            connection_stabilization_delay_ms: 50,
            disconnect_timeout_secs: 5,
            connect_retries: 3,
            retry_base_delay_ms: 300,
        }
    }
}

/// Backend-B app-server pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppServerConfig {
    /// Maximum per-agent app-server subprocesses kept alive.
    pub max_instances: usize,
    /// Idle seconds before an instance is reaped.
    pub idle_timeout_secs: u64,
    /// Sweep interval for the idle reaper, in seconds.
    pub cleanup_interval_secs: u64,
    /// Timeout for JSON-RPC requests, in seconds.
    pub request_timeout_secs: u64,
    /// Binary to launch (`<command> app-server ...`).
    pub command: String,
    /// Features passed as `--disable <name>` at launch.
    pub disabled_features: Vec<String>,
    /// Config overrides passed as `-c key=value` at launch.
    pub overrides: Vec<String>,
}

impl Default for AppServerConfig {
    fn default() -> Self {
        Self {
            max_instances: 10,
            idle_timeout_secs: 600,
            cleanup_interval_secs: 60,
            request_timeout_secs: 30,
            command: "codex".to_string(),
            disabled_features: Vec::new(),
            overrides: Vec::new(),
        }
    }
}

/// SSE broadcaster and ticket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    /// Per-subscriber bounded queue capacity.
    pub queue_capacity: usize,
    /// Keep-alive interval in seconds.
    pub keepalive_interval_secs: u64,
    /// Lifetime of signed SSE tickets in seconds.
    pub ticket_ttl_secs: u64,
    /// HMAC secret for SSE tickets. Empty disables ticket auth.
    pub ticket_secret: String,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            keepalive_interval_secs: 30,
            ticket_ttl_secs: 60,
            ticket_secret: String::new(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// SQLite database path. `None` resolves the platform default.
    pub database_path: Option<PathBuf>,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".roundtable").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".roundtable").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/roundtable/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("roundtable").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Get the default database path for the daemon.
pub fn database_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".roundtable").join("roundtable.db"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/roundtable/roundtable.db"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("roundtable").join("roundtable.db"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.storage.database_path.is_some() {
        base.storage.database_path = overlay.storage.database_path;
    }
    base.orchestrator = overlay.orchestrator;
    base.pool = overlay.pool;
    base.app_server = overlay.app_server;
    base.sse = overlay.sse;
    base.logging = overlay.logging;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("ROUNDTABLE_MAX_INSTANCES") {
        if let Ok(n) = val.parse() {
            config.app_server.max_instances = n;
        }
    }
    if let Ok(val) = std::env::var("ROUNDTABLE_IDLE_TIMEOUT") {
        if let Ok(n) = val.parse() {
            config.app_server.idle_timeout_secs = n;
        }
    }
    if let Ok(val) = std::env::var("ROUNDTABLE_APP_SERVER_COMMAND") {
        config.app_server.command = val;
    }
    if let Ok(val) = std::env::var("ROUNDTABLE_MAX_CONCURRENT_ROOMS") {
        if let Ok(n) = val.parse() {
            config.orchestrator.max_concurrent_rooms = n;
        }
    }
    if let Ok(val) = std::env::var("ROUNDTABLE_SSE_TICKET_SECRET") {
        config.sse.ticket_secret = val;
    }
    if let Ok(val) = std::env::var("ROUNDTABLE_LOG_FILTER") {
        config.logging.default_filter = val;
    }
    if let Ok(val) = std::env::var("ROUNDTABLE_LOG_JSON") {
        if let Ok(json) = val.parse() {
            config.logging.json = json;
        }
    }
}
