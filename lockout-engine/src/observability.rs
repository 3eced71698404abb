//! Structured logging setup

use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Initialize the global tracing subscriber
///
/// `service.log_level` is an `EnvFilter` directive; an unparseable value falls
/// back to `info`. `service.log_format` selects JSON or human-readable output.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.service.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match config.service.log_format.as_str() {
        "pretty" => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!(
        service = %config.service.name,
        environment = %config.service.environment,
        "Tracing initialized"
    );

    Ok(())
}
