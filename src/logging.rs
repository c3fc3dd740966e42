//! Log output
//!
//! Console, rolling file and stderr fallback layers over one global level.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILE_NAME: &str = "trap-relay.log";

/// Install the global subscriber.
///
/// `quiet` suppresses the console layer. The returned guard flushes the file
/// writer on drop and must live until the process exits.
pub fn init(config: &LoggingConfig, quiet: bool) -> Result<Option<WorkerGuard>> {
    let level: LevelFilter = config
        .level
        .parse()
        .with_context(|| format!("Invalid log level: {}", config.level))?;

    let console = (config.console_output && !quiet)
        .then(|| fmt::layer().with_writer(std::io::stdout).with_ansi(true));

    let (file, guard) = match &config.file_output {
        Some(path) => {
            let appender = rolling_appender(Path::new(path), &config.rotation_strategy)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let fallback = (console.is_none() && file.is_none())
        .then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(level)
        .with(console)
        .with(file)
        .with(fallback)
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(guard)
}

/// Unknown strategies roll daily
pub fn rotation(strategy: &str) -> Rotation {
    match strategy {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

fn rolling_appender(path: &Path, strategy: &str) -> Result<RollingFileAppender> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_FILE_NAME);

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(rotation(strategy))
        .filename_prefix(prefix)
        .build(dir)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}
