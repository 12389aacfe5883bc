//! Pluggable leveled logging.
//!
//! Servers and clients log through an `Arc<dyn Logger>`. The default
//! [`LogFacade`] forwards to the `log` crate so whatever backend the process
//! installed (usually `env_logger`, see [`init_logging`]) receives the lines.
//! [`NoopLogger`] silences everything.

use std::fmt;

pub use log::Level;

/// Log target used by [`LogFacade`].
pub const LOG_TARGET: &str = "msgsock";

/// A sink for leveled log lines.
///
/// Only [`Logger::log`] is required. Each level has a plain variant taking a
/// `&str` and a formatted variant taking [`fmt::Arguments`] (build those with
/// `format_args!`).
pub trait Logger: Send + Sync {
    /// Emit one line at `level`.
    fn log(&self, level: Level, args: fmt::Arguments<'_>);

    /// Log a debug message.
    fn debug(&self, msg: &str) {
        self.log(Level::Debug, format_args!("{msg}"));
    }

    /// Log an informational message.
    fn info(&self, msg: &str) {
        self.log(Level::Info, format_args!("{msg}"));
    }

    /// Log a warning.
    fn warn(&self, msg: &str) {
        self.log(Level::Warn, format_args!("{msg}"));
    }

    /// Log an error.
    fn error(&self, msg: &str) {
        self.log(Level::Error, format_args!("{msg}"));
    }

    /// Log a formatted debug message.
    fn debug_fmt(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    /// Log a formatted informational message.
    fn info_fmt(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    /// Log a formatted warning.
    fn warn_fmt(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    /// Log a formatted error.
    fn error_fmt(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }
}

/// Forwards to the `log` crate, optionally dropping lines below a minimum level.
#[derive(Debug, Clone, Copy)]
pub struct LogFacade {
    min_level: Level,
}

impl LogFacade {
    /// Forward every level; filtering is left to the installed backend.
    pub fn new() -> Self {
        Self {
            min_level: Level::Trace,
        }
    }

    /// Drop lines less severe than `min_level` before they reach `log`.
    pub fn with_min_level(min_level: Level) -> Self {
        Self { min_level }
    }
}

impl Default for LogFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger for LogFacade {
    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        // `Level` orders Error < Warn < Info < Debug < Trace
        if level <= self.min_level {
            log::log!(target: LOG_TARGET, level, "{args}");
        }
    }
}

/// Discards all log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: Level, _args: fmt::Arguments<'_>) {}
}

/// Install `env_logger` writing to stderr, honoring `RUST_LOG` and falling back
/// to `default_filter` (e.g. `"info"`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(default_filter: &str) {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
