//! Tracing subscriber setup for the `conveyor` binary.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::{LogFormat, LoggingSection};

const LOG_FILE_PREFIX: &str = "conveyor.log";

/// Keeps the file writer flushing; drop it only on exit.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Build the filter, with `-v` raising the default to `debug`.
pub fn filter_for(settings: &LoggingSection, verbose: bool) -> Result<EnvFilter> {
    let directive = if verbose && settings.filter == "info" {
        "debug"
    } else {
        settings.filter.as_str()
    };
    EnvFilter::try_new(directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))
}

/// Install the global subscriber. Console output goes to stderr so command output
/// on stdout stays clean.
pub fn init(settings: &LoggingSection, verbose: bool) -> Result<LoggingGuard> {
    let filter = filter_for(settings, verbose)?;

    let console = match settings.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let (file, guard) = match &settings.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard { _file: guard })
}
