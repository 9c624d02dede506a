//! Logging bootstrap.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::errors::{PenliteError, PenliteResult};

// The non-blocking writer stops flushing once its guard drops; the
// controller is process-wide, so the guard lives for the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize file logging under the controller state directory.
///
/// Log lines go to `<state_dir>/penlite.log` through a non-blocking
/// writer; the filter comes from `PENLITE_LOG` (falling back to
/// `RUST_LOG` semantics, default `info`). Safe to call more than once —
/// only the first subscriber wins, later calls are no-ops.
pub fn init_logging_for(state_dir: &Path) -> PenliteResult<()> {
    std::fs::create_dir_all(state_dir)
        .map_err(|e| PenliteError::Storage(format!("creating log dir: {}", e)))?;

    let appender = tracing_appender::rolling::never(state_dir, "penlite.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);

    let env_filter = EnvFilter::try_from_env("PENLITE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    register_to_tracing(non_blocking, env_filter);
    Ok(())
}

pub(crate) fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}
