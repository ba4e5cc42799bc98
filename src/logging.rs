//! Tracing subscriber setup.
//!
//! The filter is taken from the first of these that parses:
//!
//! 1. `AUTOTUNE_LOG`
//! 2. `RUST_LOG`
//! 3. [`LoggingSettings::level`]
//!
//! Output always goes to stderr through a `fmt` layer. When
//! [`LoggingSettings::directory`] is set, a second non-blocking layer writes
//! daily-rolled files there; keep the returned guard alive for as long as
//! file logging should be flushed.

use crate::config::LoggingSettings;
use crate::error::{AutotuneError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the crate's log filter
pub const ENV_LOG: &str = "AUTOTUNE_LOG";

/// Resolve the filter for `settings`, honoring the environment first.
pub fn build_filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(&settings.level))
}

/// Install the global subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(settings))
        .with(fmt::layer().with_ansi(settings.ansi))
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            AutotuneError::Configuration(format!("Failed to install tracing subscriber: {}", e))
        })?;

    if let Some(directory) = &settings.directory {
        tracing::info!("Logging to {}", directory.display());
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_filter_prefers_autotune_log() {
        std::env::set_var(ENV_LOG, "pipeline_autotune=trace");
        let filter = build_filter(&LoggingSettings::testing());
        std::env::remove_var(ENV_LOG);
        assert_eq!(filter.to_string(), "pipeline_autotune=trace");
    }

    #[test]
    #[serial]
    fn test_filter_falls_back_to_settings() {
        std::env::remove_var(ENV_LOG);
        let saved = std::env::var(EnvFilter::DEFAULT_ENV).ok();
        std::env::remove_var(EnvFilter::DEFAULT_ENV);

        let filter = build_filter(&LoggingSettings::testing());

        if let Some(saved) = saved {
            std::env::set_var(EnvFilter::DEFAULT_ENV, saved);
        }
        assert_eq!(filter.to_string(), "warn");
    }
}
