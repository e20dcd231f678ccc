//! Tracing initialization from the daemon's logging configuration.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialise the global tracing subscriber from [`LoggingConfig`].
///
/// The configured `default_filter` only applies when `RUST_LOG` is unset,
/// so operators can raise verbosity per target without touching settings
/// files. `json` switches to structured log lines for collectors.
pub fn init_tracing(config: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.default_filter.clone()),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
