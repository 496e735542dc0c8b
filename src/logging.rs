//! Structured logging initialization.
//!
//! The library only emits `tracing` events; binaries call [`init`] once at
//! startup to install a subscriber. The RUST_LOG environment variable takes
//! precedence over the configured level.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging subsystem.
///
/// # Example
///
/// ```ignore
/// use sockmgr::config::LoggingConfig;
///
/// sockmgr::logging::init(&LoggingConfig::default());
/// tracing::info!("reactor starting");
/// ```
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let registry = tracing_subscriber::registry().with(filter);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry
            .with(fmt::layer().with_ansi(true).with_target(config.target))
            .init(),
        (LogFormat::Pretty, false) => registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(config.target)
                    .without_time(),
            )
            .init(),
        (LogFormat::Json, true) => registry
            .with(fmt::layer().json().with_target(config.target))
            .init(),
        (LogFormat::Json, false) => registry
            .with(fmt::layer().json().with_target(config.target).without_time())
            .init(),
        (LogFormat::Compact, true) => registry
            .with(fmt::layer().compact().with_target(config.target))
            .init(),
        (LogFormat::Compact, false) => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(config.target)
                    .without_time(),
            )
            .init(),
    }
}
