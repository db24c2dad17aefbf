use anyhow::Result;
use std::path::Path;
use tracing::{Level, Subscriber};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::RUN_LOG_TARGET;

pub const LOG_DIR: &str = "logs";
pub const RUN_LOG_FILE: &str = "pipeline.log";

/// Appends `run_log` events (pipeline start / success / failure) to
/// `dir/file`, one timestamped line each. Everything else is filtered out.
pub fn run_log_layer<S>(dir: &Path, file: &str) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = tracing_appender::rolling::never(dir, file);
    fmt::layer()
        .with_writer(appender)
        .with_target(false)
        .with_ansi(false)
        .with_filter(Targets::new().with_target(RUN_LOG_TARGET, Level::INFO))
}

/// Console output filtered by `RUST_LOG`, plus the run log under `logs/`.
pub fn setup_logging() -> Result<()> {
    std::fs::create_dir_all(LOG_DIR)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn")
    });
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(run_log_layer(Path::new(LOG_DIR), RUN_LOG_FILE))
        .init();
    Ok(())
}
