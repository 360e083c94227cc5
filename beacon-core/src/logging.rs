//! Log file setup for beacon binaries
//!
//! The library only emits `tracing` events; a binary calls [`init`] once to
//! route them to a daily file `beacon.log.YYYY-MM-DD` in
//! `$XDG_STATE_HOME/beacon/`.
//!
//! The queue worker runs inside a `queue{client=..}` span on the
//! `beacon-queue` thread, so `RUST_LOG=beacon_core::queue=debug` narrows the
//! file to delivery history and each line names the client it belongs to.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "beacon.log";

/// HTTP internals that would otherwise log every connection attempt the
/// worker makes while the server is down
const QUIET_TARGETS: &[&str] = &["reqwest=warn", "hyper=warn", "hyper_util=warn", "rustls=warn"];

/// Filter used when `RUST_LOG` is unset
fn default_directives(level: &str) -> String {
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_TARGETS.iter().map(|t| t.to_string()));
    directives.join(",")
}

/// Install the global subscriber writing to the state directory.
///
/// Fails if a subscriber is already installed. Keep the returned guard
/// alive until exit or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&config.level)))
        .map_err(|e| Error::Config(format!("invalid logging.level {:?}: {}", config.level, e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::debug!(log_dir = %log_dir.display(), level = %config.level, "Logging to file");

    Ok(LoggingGuard { _guard: guard })
}

/// Flushes the non-blocking writer when dropped
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}
