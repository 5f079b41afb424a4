//! # Structured Logging
//!
//! Installs a `tracing-subscriber` fmt subscriber driven by [`LoggingConfig`].
//! `RUST_LOG` wins over the configured default level.

use crate::config::LoggingConfig;
use crate::errors::{Error, Result};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global subscriber.
///
/// Fails with [`Error::Internal`] when a subscriber is already installed, so
/// embedding processes that own logging can ignore the result.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("Invalid log level '{}': {}", config.level, e)))?;

    let installed = if config.json {
        tracing::subscriber::set_global_default(
            FmtSubscriber::builder().with_env_filter(filter).json().finish(),
        )
    } else {
        tracing::subscriber::set_global_default(
            FmtSubscriber::builder().with_env_filter(filter).finish(),
        )
    };

    installed.map_err(|e| Error::internal(format!("Logging already initialized: {}", e)))?;

    tracing::info!(level = %config.level, json = config.json, "Logging initialized");
    Ok(())
}

/// Span wrapping one global snapshot rebuild
#[macro_export]
macro_rules! snapshot_span {
    ($operation:expr) => {
        tracing::info_span!("snapshot_operation", operation = %$operation)
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::info_span!("snapshot_operation", operation = %$operation, $($field)*)
    };
}
