//! Tracing setup for applications embedding the store

use crate::error::{SyncError, SyncResult};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Install a global subscriber. `RUST_LOG` overrides the default filter.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(verbose: bool, format: LogFormat) -> SyncResult<()> {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("carestore_sync={},sqlx=warn", level).into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_level(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
    };

    installed.map_err(|e| SyncError::Configuration(format!("Failed to install tracing subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let first = init_tracing(false, LogFormat::Json);
        let second = init_tracing(true, LogFormat::Pretty);

        // Another test may have installed a subscriber first
        assert!(first.is_err() || second.is_err());
        assert!(matches!(second, Err(SyncError::Configuration(_))));
    }
}
