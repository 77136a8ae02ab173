//! Log subscriber setup
//!
//! Text output goes to stdout and a rolling file; JSON output goes to the file only.
//! `RUST_LOG` overrides the configured level.

use anyhow::Context;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

fn rotation(name: &str) -> anyhow::Result<Rotation> {
    match name.to_ascii_lowercase().as_str() {
        "minutely" => Ok(Rotation::MINUTELY),
        "hourly" => Ok(Rotation::HOURLY),
        "daily" => Ok(Rotation::DAILY),
        "never" => Ok(Rotation::NEVER),
        other => anyhow::bail!("unknown log rotation: {other}"),
    }
}

/// Base directive: configured level for the connector, sqlx statements only above warn
fn directives(config: &AppConfig) -> String {
    format!("{},sqlx=warn,hyper=warn,reqwest=warn", config.log_level)
}

/// Install the global subscriber; keep the guard alive until shutdown
pub fn init_logging(config: &AppConfig) -> anyhow::Result<WorkerGuard> {
    let appender = RollingFileAppender::builder()
        .rotation(rotation(&config.rotation)?)
        .filename_prefix(format!("{}.{}", config.log_file, config.runtime_id))
        .build(&config.log_dir)
        .with_context(|| format!("Failed to open log directory {}", config.log_dir))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(false)
                    .with_writer(file_writer)
                    .with_ansi(false),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(file_writer)
                    .with_ansi(false),
            )
            .with(fmt::layer().with_target(false))
            .init();
    }

    info!(
        runtime_id = %config.runtime_id,
        log_dir = %config.log_dir,
        rotation = %config.rotation,
        json = config.use_json,
        "Logging initialized"
    );
    Ok(guard)
}
