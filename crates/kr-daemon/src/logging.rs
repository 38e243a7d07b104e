//! Log sink setup for `krd`.
//!
//! `KR_LOG_LEVEL` uses the daemon's historical level names; `RUST_LOG`, when
//! set, replaces the whole filter.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use kr_core::dirs::LOG_FILE;

const TARGETS: [&str; 4] = ["krd", "kr_core", "kr_crypto", "kr_daemon"];

/// Map a `KR_LOG_LEVEL` name onto a tracing level.
pub fn level_directive(name: &str) -> &'static str {
    match name.trim().to_ascii_uppercase().as_str() {
        "CRITICAL" | "ERROR" => "error",
        "WARNING" | "WARN" => "warn",
        "DEBUG" => "debug",
        "TRACE" => "trace",
        _ => "info",
    }
}

pub fn filter_directives(level_name: &str) -> String {
    let level = level_directive(level_name);
    TARGETS
        .iter()
        .map(|t| format!("{}={}", t, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Keeps the file writer flushing; drop it last.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. With both sinks disabled, logs are
/// dropped.
pub fn init(level_name: &str, run_dir: &Path, no_stderr: bool, to_file: bool) -> LogGuard {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directives(level_name)))
    };

    let stderr_layer = (!no_stderr).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter())
    });

    let (file_layer, guard) = if to_file {
        let appender = tracing_appender::rolling::daily(run_dir, LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(filter());
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    LogGuard { _file: guard }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historical_level_names() {
        assert_eq!(level_directive("CRITICAL"), "error");
        assert_eq!(level_directive("warning"), "warn");
        assert_eq!(level_directive("NOTICE"), "info");
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive("nonsense"), "info");
    }

    #[test]
    fn directives_cover_every_crate() {
        let d = filter_directives("DEBUG");
        assert!(d.contains("kr_core=debug"));
        assert!(d.contains("kr_daemon=debug"));
        assert!(d.contains("krd=debug"));
    }
}
