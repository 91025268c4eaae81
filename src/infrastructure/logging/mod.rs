//! Tracing initialization.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use crate::domain::models::config::LoggingConfig;

/// Initialize the global tracing subscriber.
///
/// Returns the appender worker guard when file logging is configured;
/// the binary must hold it for the process lifetime.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    if let Some(directory) = &config.directory {
        let appender = tracing_appender::rolling::daily(directory, "basalt.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        if config.format == "json" {
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .json()
                .init();
        } else {
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
        }
        return Some(guard);
    }

    if config.format == "json" {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
    None
}
