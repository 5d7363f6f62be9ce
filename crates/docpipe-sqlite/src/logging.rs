//! Structured logging setup
//!
//! - Human-readable console logging for development
//! - Structured JSON logging for production
//! - File output with daily rotation
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the embedding program through [`init`].

use crate::config::LoggingConfig;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE: &str = "docpipe.log";

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format for development
    Pretty,
    /// JSON format for production
    Json,
    /// Compact format for testing
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to pretty.
    pub fn parse(name: &str) -> Self {
        match name {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }

    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|name| Self::parse(&name))
            .unwrap_or(LogFormat::Pretty)
    }
}

/// Log output configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File,
    Both,
}

impl LogOutput {
    /// Unknown names fall back to stdout.
    pub fn parse(name: &str) -> Self {
        match name {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stdout,
        }
    }

    pub fn from_env() -> Self {
        std::env::var("LOG_OUTPUT")
            .map(|name| Self::parse(&name))
            .unwrap_or(LogOutput::Stdout)
    }
}

/// Install a global subscriber according to `config`.
///
/// `config.level` is an `EnvFilter` directive string such as
/// `"info"` or `"docpipe_sqlite=debug,warn"`; invalid directives fall back to
/// `info`. Fails if a global subscriber is already set.
///
/// ```bash
/// # Development: pretty console output at debug level
/// RUST_LOG=debug LOG_FORMAT=pretty
///
/// # Production: JSON to daily files
/// RUST_LOG=info LOG_FORMAT=json LOG_OUTPUT=file LOG_DIR=/var/log/docpipe
/// ```
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let format = LogFormat::parse(&config.format);
    let output = LogOutput::parse(&config.output);
    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    match (output, format) {
        (LogOutput::Stdout, LogFormat::Pretty) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_thread_ids(true).with_target(true))
            .try_init()?,
        (LogOutput::Stdout, LogFormat::Json) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?,
        (LogOutput::Stdout, LogFormat::Compact) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact())
            .try_init()?,
        (LogOutput::File, _) => {
            let file_appender = file_appender(&config.directory);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(file_appender).with_ansi(false))
                .try_init()?
        }
        (LogOutput::Both, format) => {
            let file_appender = file_appender(&config.directory);

            let stdout_layer = match format {
                LogFormat::Pretty => fmt::layer().pretty().with_thread_ids(true).with_target(true).boxed(),
                LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
                LogFormat::Compact => fmt::layer().compact().boxed(),
            };
            let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false).boxed();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .try_init()?
        }
    }

    tracing::info!(format = ?format, output = ?output, level = %config.level, "logging initialized");
    if matches!(output, LogOutput::File | LogOutput::Both) {
        tracing::debug!(directory = %config.directory, file = LOG_FILE, "writing log files");
    }
    Ok(())
}

fn file_appender(directory: &str) -> RollingFileAppender {
    if let Err(err) = std::fs::create_dir_all(directory) {
        eprintln!("cannot create log directory {directory}: {err}");
    }
    RollingFileAppender::new(Rotation::DAILY, directory, LOG_FILE)
}
