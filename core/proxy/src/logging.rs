//! Logging setup.
//!
//! Stdout belongs to the wire protocol, so logs go to `<cache>/logs/<role>.log`
//! and fall back to stderr when that directory cannot be created.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub fn init(role: &str, log_dir: &Path, debug_enabled: bool) -> Option<WorkerGuard> {
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if let Err(err) = fs_err::create_dir_all(log_dir) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
        tracing::warn!(error = %err, "Log directory unavailable, logging to stderr");
        return None;
    }

    let appender = tracing_appender::rolling::never(log_dir, format!("{}.log", role));
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init();
    Some(guard)
}
