//! Diagnostic tracing for foreman itself.
//!
//! - **Tracing (this module)**: foreman's own diagnostics, filtered by
//!   `RUST_LOG`, written to stderr and optionally to a daily file under
//!   `.foreman/logs/`.
//! - **Worker logs (`executor`)**: each worker's stdout/stderr, written
//!   verbatim to `.foreman/logs/<agent-id>.log`. Unaffected by `RUST_LOG`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "foreman.log";

/// Filter used when `RUST_LOG` is unset.
fn default_directive(verbose: bool) -> &'static str {
    if verbose { "warn,foreman=debug" } else { "warn" }
}

/// Install the global subscriber.
///
/// With `log_dir`, events are also appended to a daily-rolling file there;
/// keep the returned guard alive until exit so buffered lines get flushed.
/// Calling this twice is harmless: the second subscriber is not installed.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::new(default_directive(verbose)),
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(file_layer)
        .try_init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_enables_debug_for_crate() {
        assert_eq!(default_directive(false), "warn");
        assert!(default_directive(true).contains("foreman=debug"));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let _first = init(false, Some(dir.path()));
        let _second = init(true, None);
        tracing::warn!("logging initialised");
    }
}
