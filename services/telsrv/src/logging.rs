//! Logger initialization with file and console output
//!
//! File logs are rotated daily via `tracing-appender`; console output is
//! the default for interactive runs.

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Initialize the global logger.
///
/// # Arguments
///
/// * `log_dir` - Directory where log files are stored (file mode only)
/// * `service_name` - Used as the log file stem and default filter target
/// * `level` - Log level (trace, debug, info, warn, error)
/// * `console` - Log to console instead of a rolling file
pub fn init_logger(
    log_dir: impl AsRef<Path>,
    service_name: &str,
    level: &str,
    console: bool,
) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}={level}")));

    if console {
        fmt().with_env_filter(env_filter).init();
        tracing::info!(
            "Logger initialized for service: {} (console mode)",
            service_name
        );
    } else {
        std::fs::create_dir_all(&log_dir)?;

        let file_appender = RollingFileAppender::new(
            Rotation::DAILY,
            log_dir,
            format!("{service_name}.log"),
        );

        fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender)
            .with_ansi(false)
            .init();

        tracing::info!(
            "Logger initialized for service: {} (file mode)",
            service_name
        );
    }

    Ok(())
}
