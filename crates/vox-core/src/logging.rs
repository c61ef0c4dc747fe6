//! Logging setup for the producer and the worker process.
//!
//! Both sides log through `tracing`; this module installs the global
//! `tracing-subscriber` registry once per process. `RUST_LOG` wins over the
//! configured level when set.
//!
//! A worker process writes protocol events on stdout, so it must log with
//! [`LogTarget::Stderr`]. Calling [`init`] again after a subscriber exists is a
//! no-op, which keeps tests and embedding applications happy.
//!
//! # Example
//! ```no_run
//! use vox_core::{config::VoxConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), vox_core::VoxError> {
//! let config = VoxConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(batch_depth = config.writer.batch_depth, "writer configured");
//! # Ok(())
//! # }
//! ```

use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{LogFormat, VoxConfig};
use crate::error::VoxError;

/// Stream that formatted events go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTarget {
    /// Standard output
    #[default]
    Stdout,
    /// Standard error, for worker processes
    Stderr,
}

/// Subscriber settings for one process.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Fallback level when `RUST_LOG` is unset
    pub level: Level,
    /// Event layout
    pub format: LogFormat,
    /// Output stream
    pub target: LogTarget,
    /// Log span open/close (useful to time batches)
    pub span_events: bool,
    /// Include source file and line
    pub source_location: bool,
    /// Include thread names (`vox-worker-*`, `vox-worker-relay`)
    pub thread_names: bool,
    /// Colorize pretty output
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            target: LogTarget::Stdout,
            span_events: false,
            source_location: true,
            thread_names: true,
            ansi: true,
        }
    }
}

impl TracingConfig {
    /// Settings from the `[logging]` section.
    pub fn from_config(config: &VoxConfig) -> Result<Self, VoxError> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: config.logging.format,
            ..Self::default()
        })
    }

    /// Defaults at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Use `format`.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Write to `target`.
    #[must_use]
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Log span lifecycle events.
    #[must_use]
    pub fn with_span_events(mut self, span_events: bool) -> Self {
        self.span_events = span_events;
        self
    }

    /// Colorize output. Worker stderr is usually captured, so workers turn this off.
    #[must_use]
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    fn make_writer(&self) -> BoxMakeWriter {
        match self.target {
            LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
        }
    }
}

/// Install the subscriber described by the `[logging]` section.
pub fn init_from_config(config: &VoxConfig) -> Result<(), VoxError> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` without changes when a global subscriber already exists.
pub fn init(config: TracingConfig) -> Result<(), VoxError> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    let fmt_layer = fmt::layer()
        .with_writer(config.make_writer())
        .with_span_events(if config.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_thread_names(config.thread_names);

    let layer = match config.format {
        LogFormat::Pretty => fmt_layer.pretty().with_ansi(config.ansi).boxed(),
        LogFormat::Compact => fmt_layer.compact().with_ansi(false).boxed(),
        LogFormat::Json => fmt_layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .or_else(|e| {
            // Lost a race with another initializer
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(VoxError::Config(format!(
                    "cannot install tracing subscriber: {}",
                    e
                )))
            }
        })
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, VoxError> {
    level.trim().parse::<Level>().map_err(|_| {
        VoxError::Config(format!(
            "unknown log level '{}', expected trace, debug, info, warn or error",
            level
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_names() {
        for (name, level) in [
            ("trace", Level::TRACE),
            ("DEBUG", Level::DEBUG),
            ("Info", Level::INFO),
            (" warn", Level::WARN),
            ("error", Level::ERROR),
        ] {
            assert_eq!(parse_log_level(name).unwrap(), level);
        }
        assert!(matches!(parse_log_level("loud"), Err(VoxError::Config(_))));
    }

    #[test]
    fn test_from_config_uses_logging_section() {
        let mut config = VoxConfig::default();
        config.logging.level = "debug".into();
        config.logging.format = LogFormat::Json;

        let settings = TracingConfig::from_config(&config).unwrap();
        assert_eq!(settings.level, Level::DEBUG);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.target, LogTarget::Stdout);

        config.logging.level = "verbose".into();
        assert!(TracingConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_worker_settings() {
        let worker = TracingConfig::new(Level::WARN)
            .with_format(LogFormat::Compact)
            .with_target(LogTarget::Stderr)
            .with_span_events(true)
            .with_ansi(false);

        assert_eq!(worker.level, Level::WARN);
        assert_eq!(worker.target, LogTarget::Stderr);
        assert!(worker.span_events);
        assert!(!worker.ansi);
    }

    #[test]
    fn test_second_init_is_noop() {
        let config = TracingConfig::new(Level::INFO).with_format(LogFormat::Compact);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
