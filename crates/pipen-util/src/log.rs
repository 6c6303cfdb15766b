//! Logger construction on the `slog` + `slog-term` + `slog-async` stack.
//! Library crates take a [`slog::Logger`] by value; only the CLI binary
//! builds the root logger.

use slog::{o, Drain};
use std::str::FromStr;

/// Minimum level to emit, set by `--loglevel` / `PIPEN_LOGLEVEL`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

impl LogLevel {
    fn to_slog(self) -> slog::Level {
        match self {
            Self::Trace => slog::Level::Trace,
            Self::Debug => slog::Level::Debug,
            Self::Info => slog::Level::Info,
            Self::Warn => slog::Level::Warning,
            Self::Error => slog::Level::Error,
        }
    }
}

/// Build the root logger used by the `pipen` binary: an async drain over a
/// full-format terminal drain, filtered to `level`.
pub fn root_logger(level: LogLevel) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level.to_slog()).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!())
}

/// A logger that discards everything, for tests and library default
/// construction.
pub fn discard_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}
