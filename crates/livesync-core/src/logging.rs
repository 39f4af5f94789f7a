//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Environment variable that overrides the log filter
pub const LOG_ENV_VAR: &str = "LIVESYNC_LOG";

const LOG_FILE_NAME: &str = "livesync.log";
const DEFAULT_FILTER: &str = "livesync=info,warn";

/// Initialize the logging subsystem
///
/// Logs are written to `<data dir>/livesync/logs/` because stdout is
/// reserved for the NDJSON event stream.
/// Log level is controlled by the `LIVESYNC_LOG` environment variable.
///
/// # Examples
/// ```bash
/// LIVESYNC_LOG=debug livesync ./my-app
/// LIVESYNC_LOG=livesync_device=trace livesync ./my-app
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_NAME);

    let env_filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!("───────────────────────────────────────────────────────");
    tracing::info!("livesync starting (v{})", env!("CARGO_PKG_VERSION"));
    tracing::info!("Log directory: {}", log_dir.display());
    tracing::info!("───────────────────────────────────────────────────────");

    Ok(())
}

fn get_log_directory() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("livesync").join("logs")
}

/// Path of the log file for the current day's appender
pub fn current_log_file() -> PathBuf {
    get_log_directory().join(LOG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_lives_under_livesync_logs() {
        let path = current_log_file();
        assert!(path.ends_with("livesync/logs/livesync.log"));
    }
}
