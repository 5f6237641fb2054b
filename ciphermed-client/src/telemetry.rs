use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking,
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime},
    prelude::*,
    EnvFilter, Registry,
};

/// The log file name.
const LOG_FILE: &str = "ciphermed-client.log";

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,ciphermed_exchange=debug";

/// Configure logging with JSON output to a daily rolling file and pretty
/// console output.
///
/// The returned guard flushes the file writer when dropped and must be held
/// for as long as the process logs.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already set.
pub fn setup_logging<P: AsRef<Path>>(log_dir: P) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir.as_ref()).context("Failed to create logs directory")?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_appender);

    let console_layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_span_events(FmtSpan::ENTER);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to set global tracing subscriber")?;

    Ok(guard)
}
