use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    prelude::*,
    EnvFilter,
};

/// Logging configuration, read from the embedding configuration layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Env-filter directives; `RUST_LOG` wins when set.
    pub filter: Option<String>,
    /// Directory for daily-rolling file output. Console-only when unset.
    pub dir: Option<PathBuf>,
    /// Filename prefix for the rolling log files.
    pub file_prefix: Option<String>,
}

/// Initialize console logging plus optional daily-rolling file output.
/// Returns the appender guard; dropping it flushes and stops the background
/// writer, so hold it for the life of the process.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            config
                .filter
                .as_deref()
                .unwrap_or("emberweb=info,hyper=warn,warn"),
        )
    });

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(std::io::stderr);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(config.file_prefix.as_deref().unwrap_or("emberweb"))
                .build(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_target(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(false)
                .with_writer(writer);
            registry.with(file_layer).init();
            tracing::info!(dir = %dir.display(), "logging initialized with file output");
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

/// Console-only logging for tests; safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("emberweb=debug")),
        )
        .try_init();
}
