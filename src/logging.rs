//! Tracing setup for the `vigil` binary.
//!
//! Everything goes to stderr. The daemon additionally writes a daily-rolling
//! file under `<data_dir>/logs/`. `RUST_LOG` overrides the default filter.

use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "vigil=info";

/// Log file prefix; the appender adds the date suffix.
pub const LOG_FILE_PREFIX: &str = "vigil.log";

/// Keeps the file writer alive. Dropping it flushes pending lines.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialise stderr logging, plus a rolling file in `log_dir` when given.
///
/// # Errors
///
/// Returns an error if `log_dir` cannot be created.
pub fn init(log_dir: Option<&Path>) -> io::Result<LoggingGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    let Some(dir) = log_dir else {
        // A second init (e.g. from tests) is harmless.
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(stderr_layer)
            .try_init();
        return Ok(LoggingGuard { _file_guard: None });
    };

    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Ok(LoggingGuard {
        _file_guard: Some(guard),
    })
}
