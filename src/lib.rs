pub mod config;
pub mod dashboard;
pub mod fetch;
pub mod keepalive;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod portfolio;
pub mod report;
pub mod schedule;
pub mod series;
pub mod strategy;

use clap::{Args, Parser};
use std::path::PathBuf;

pub use config::{Objective, PipelineConfig, RebalancePeriod};

/// Tracing target for the append-only run log (start/success/failure lines).
pub const RUN_LOG_TARGET: &str = "run_log";

/// Pipeline options shared by `run`, `fetch` and `dashboard --refresh`.
#[derive(Args, Debug, Clone, Default)]
pub struct PipelineArgs {
    /// Result file (JSON). Overwritten atomically on success
    #[arg(long)]
    pub results: Option<PathBuf>,

    /// Read prices from a local CSV (date,btc,eth) instead of CoinGecko
    #[arg(long)]
    pub prices_csv: Option<PathBuf>,

    /// Your CoinGecko Pro API key (or set CG_PRO_API_KEY env)
    #[arg(long)]
    pub api_key: Option<String>,

    /// CoinGecko Demo API key (or set CG_DEMO_API_KEY env). Public endpoint, last 365 days only
    #[arg(long)]
    pub demo_api_key: Option<String>,

    /// Delay between CoinGecko requests in milliseconds
    #[arg(long)]
    pub request_delay_ms: Option<u64>,

    /// VS currency (e.g., usd, eur, krw)
    #[arg(long)]
    pub vs: Option<String>,

    /// Start date (inclusive), format YYYY-MM-DD
    #[arg(long)]
    pub start: Option<String>,

    /// End date (inclusive), format YYYY-MM-DD. Defaults to today (UTC)
    #[arg(long)]
    pub end: Option<String>,

    /// Candidate MA windows in days, comma separated. Example: --windows 20,50,100
    #[arg(long, value_delimiter = ',')]
    pub windows: Option<Vec<usize>>,

    /// Rebalancing period for the blended portfolios
    #[arg(long, value_enum)]
    pub rebalance: Option<RebalancePeriod>,

    /// BTC target weights of the rebalanced blends, comma separated (ETH gets the rest)
    #[arg(long, value_delimiter = ',')]
    pub blends: Option<Vec<f64>>,

    /// Window selection objective
    #[arg(long, value_enum)]
    pub objective: Option<Objective>,

    /// Lock file guarding the result file (defaults to <results>.lock)
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

/// Renders the last result bundle in the terminal and as an SVG chart.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct DashboardArgs {
    /// Re-run the pipeline synchronously before rendering
    #[arg(long)]
    pub refresh: bool,

    /// Where to write the equity chart (SVG)
    #[arg(long)]
    pub chart: Option<PathBuf>,

    /// Skip the SVG chart
    #[arg(long)]
    pub no_chart: bool,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Exports the aligned BTC/ETH daily closes to CSV.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct FetchArgs {
    /// Output CSV path
    #[arg(long)]
    pub out: Option<PathBuf>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Scheduling helpers for the daily run.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct ScheduleArgs {
    /// What to generate
    #[arg(long, value_enum)]
    pub format: Option<schedule::ScheduleFormat>,

    /// Daily run time (HH:MM, UTC for CI, local time for cron/systemd)
    #[arg(long)]
    pub at: Option<String>,

    /// Installation directory of the binary and working directory of the job
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Output directory for the generated files
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Pings the hosted dashboard so it does not go to sleep.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct KeepaliveArgs {
    /// URL to ping (or set APP_URL env)
    #[arg(long)]
    pub url: Option<String>,

    /// Request timeout in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}
