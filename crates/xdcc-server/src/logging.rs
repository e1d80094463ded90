//! Structured logging setup: a `tracing_subscriber` fmt layer to stdout,
//! plus an optional append-mode file layer when `LOG_FILE` is set.
//!
//! `DISABLE_PROGRESS_ANSI` controls whether the stdout layer emits ANSI
//! color codes. Tracing's line-oriented formatter has no notion of
//! rewriting the previous line, so the carriage-return-vs-full-line
//! distinction spec.md draws for TTY progress output is realized here as
//! ANSI-on (colored, TTY-friendly) vs ANSI-off (plain, container-log-driver
//! friendly) — both still one full structured line per tick, which is what
//! this crate's progress throttle already produces. The file layer is
//! always ANSI-off regardless, since log files are never a TTY.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Must be kept alive for the process lifetime — dropping it stops the
/// non-blocking file writer from flushing.
pub struct LoggingGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

pub fn init(config: &Config) -> anyhow::Result<LoggingGuard> {
    let default_filter = if config.debug {
        "xdcc_server=debug,xdcc_transfer=debug"
    } else {
        "xdcc_server=info,xdcc_transfer=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let stdout_layer = fmt::layer().with_ansi(!config.disable_progress_ansi);

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Ok(LoggingGuard(Some(guard)))
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .init();
            Ok(LoggingGuard(None))
        }
    }
}
