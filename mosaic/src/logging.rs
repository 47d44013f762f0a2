//! Process-wide logging for embedding applications.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to
//! the caller. [`setup_logging`] is the default installation used by batch
//! drivers: console output plus a daily-rotated file under `log_dir`.

use std::path::Path;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. `RUST_LOG` overrides `base_level`.
///
/// Panics when called twice or when the log directory cannot be created.
pub fn setup_logging(base_level: &str, log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(base_level))
        .unwrap_or_else(|e| panic!("Invalid log filter: {}", e));

    let file_appender = rolling_appender(log_dir)
        .unwrap_or_else(|e| panic!("Failed to create log file appender in {}: {}", log_dir.display(), e));

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    if LOG_GUARD.set(guard).is_err() {
        panic!("Logging already initialized");
    }

    // Warnings (skipped keys, failed writes) also go to stderr.
    let console_writer = std::io::stdout.and(std::io::stderr.with_min_level(Level::WARN));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(true)
        .with_writer(console_writer);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .unwrap_or_else(|e| panic!("Logger initialization failed: {}", e));
}

/// Daily-rotated `mosaic.*.log` files in `log_dir`, which is created if needed.
fn rolling_appender(log_dir: &Path) -> std::io::Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("mosaic")
        .filename_suffix("log")
        .max_log_files(5)
        .build(log_dir)
        .map_err(std::io::Error::other)
}
