//! Logging configuration and initialization.
//!
//! Sets up the tracing subscriber from the application configuration,
//! writing through a non-blocking appender to stdout, stderr or a file.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::io;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Dependencies whose output is capped at `warn` unless dependency tracing is on.
const QUIET_DEPENDENCIES: &[&str] = &["pingora_core", "pingora_proxy", "hyper", "reqwest", "h2"];

/// Initializes the logging system based on configuration.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure all logs are flushed.
///
/// # Arguments
///
/// * `config` - The logging configuration
/// * `level_override` - Optional level override from CLI/environment
/// * `trace_deps` - If true, include verbose logging from dependencies
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<String>,
    trace_deps: bool,
) -> io::Result<WorkerGuard> {
    let level = parse_level(level_override.as_deref().unwrap_or(&config.level));
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(level, trace_deps)));

    let (writer, guard) = open_writer(&config.output)?;

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(config.include_target)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_target(config.include_target)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_target(config.include_target)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
    }

    Ok(guard)
}

fn open_writer(output: &str) -> io::Result<(NonBlocking, WorkerGuard)> {
    Ok(match output.to_lowercase().as_str() {
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "stderr" => tracing_appender::non_blocking(io::stderr()),
        _ => {
            let file = OpenOptions::new().create(true).append(true).open(output)?;
            tracing_appender::non_blocking(file)
        }
    })
}

/// Builds the default filter when `RUST_LOG` is not set.
fn filter_directives(level: Level, trace_deps: bool) -> String {
    let level = level.to_string().to_lowercase();
    if trace_deps {
        return level;
    }

    let mut directives = level;
    for dep in QUIET_DEPENDENCIES {
        directives.push_str(&format!(",{}=warn", dep));
    }
    directives
}

/// Parses a log level string to a tracing Level.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
