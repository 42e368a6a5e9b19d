//! Tracing subscriber setup for applications embedding the engine.
//!
//! The engine itself only emits `tracing` events. Raw XML goes to the
//! [`TRAFFIC_TARGET`] target at debug level, so it stays out of the logs
//! unless asked for.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Target of the `SENT`/`RECV` traffic events.
pub const TRAFFIC_TARGET: &str = "fluux_xmpp::traffic";

/// Stderr verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Lifecycle and errors, no XML.
    Default,
    /// Everything in `Default` plus raw XML traffic.
    Traffic,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Directory of the daily-rotating log file; no file when `None`.
    pub log_dir: Option<PathBuf>,
    /// Stderr output; none when `None` unless `RUST_LOG` is set.
    pub stderr: Option<Verbosity>,
}

impl LogOptions {
    /// File logging to [`default_log_dir`] and no stderr output.
    pub fn with_default_dir() -> Self {
        Self {
            log_dir: Some(default_log_dir()),
            stderr: None,
        }
    }
}

/// Platform log directory:
///   Linux:   ~/.local/share/fluux-xmpp/logs/  (or $XDG_DATA_HOME)
///   macOS:   ~/Library/Logs/fluux-xmpp/
///   Windows: %LOCALAPPDATA%\fluux-xmpp\logs\
pub fn default_log_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("fluux-xmpp").join("logs");

    #[cfg(target_os = "macos")]
    let dir = dirs::home_dir()
        .map(|h| h.join("Library").join("Logs").join("fluux-xmpp"))
        .unwrap_or(dir);

    dir
}

fn default_directives(verbosity: Verbosity) -> &'static str {
    match verbosity {
        Verbosity::Default => "fluux_xmpp=info,fluux_xmpp::traffic=off,info",
        Verbosity::Traffic => "fluux_xmpp=info,fluux_xmpp::traffic=debug,info",
    }
}

fn filter(verbosity: Verbosity) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(verbosity))
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// as long as logging is wanted.
pub fn init_logging(options: LogOptions) -> Result<Option<WorkerGuard>> {
    let mut guard = None;

    let file_layer = match &options.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                Error::Config(format!(
                    "Could not create log directory '{}': {}",
                    log_dir.display(),
                    e
                ))
            })?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "fluux-xmpp.log");
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_filter(filter(Verbosity::Default)),
            )
        }
        None => None,
    };

    let stderr_verbosity = options
        .stderr
        .or_else(|| std::env::var("RUST_LOG").is_ok().then_some(Verbosity::Default));
    let stderr_layer = stderr_verbosity.map(|verbosity| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter(verbosity))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Logging already initialised: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traffic_only_in_traffic_verbosity() {
        assert!(default_directives(Verbosity::Default).contains("fluux_xmpp::traffic=off"));
        assert!(default_directives(Verbosity::Traffic).contains("fluux_xmpp::traffic=debug"));
    }

    #[test]
    fn test_default_log_dir_is_app_specific() {
        let dir = default_log_dir();
        assert!(dir.to_string_lossy().contains("fluux-xmpp"));
    }

    #[test]
    fn test_directives_parse() {
        assert!(EnvFilter::try_new(default_directives(Verbosity::Default)).is_ok());
        assert!(EnvFilter::try_new(default_directives(Verbosity::Traffic)).is_ok());
    }
}
