use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::fetch::{PriceSource, Source, fetch_aligned};
use crate::{PipelineArgs, RUN_LOG_TARGET};
use crate::portfolio;
use crate::report::{self, DataPeriod, PortfolioResult, ResultBundle, StrategyResult};
use crate::series::{AlignedPrices, Asset};
use crate::strategy::optimize;

/// Resolves the flags, runs the pipeline once and prints a short summary.
pub async fn execute(args: &PipelineArgs) -> Result<()> {
    let cfg = args.resolve().map_err(log_failure)?;
    let bundle = run_configured(&cfg).await?;
    println!(
        "✅ {} .. {}: {} portfolios written to {}",
        bundle.data_period.start,
        bundle.data_period.end,
        bundle.portfolios.len(),
        cfg.results.display()
    );
    for p in &bundle.portfolios {
        println!(
            "   {:<20} {:>10.2}x  MDD {:>6.2}%",
            p.label,
            p.metrics.final_value,
            p.metrics.max_drawdown * 100.0
        );
    }
    Ok(())
}

/// Runs with the provider named by `cfg`. A provider that cannot be set up
/// counts as a failed run.
pub async fn run_configured(cfg: &PipelineConfig) -> Result<ResultBundle> {
    let source = Source::from_config(cfg).map_err(log_failure)?;
    run(&source, cfg).await
}

/// Writes the failure line to the run log and hands the error back.
pub fn log_failure(e: anyhow::Error) -> anyhow::Error {
    error!(target: RUN_LOG_TARGET, "pipeline failure: {e:#}");
    e
}

/// Fetch → optimize → combine → write. On any failure nothing is written and
/// the previous result file stays as it was.
pub async fn run<S: PriceSource>(source: &S, cfg: &PipelineConfig) -> Result<ResultBundle> {
    info!(
        target: RUN_LOG_TARGET,
        "pipeline start: {} .. {}, {} windows, {} rebalancing",
        cfg.start,
        cfg.end,
        cfg.windows.len(),
        cfg.rebalance.label()
    );
    let t0 = Instant::now();
    match run_inner(source, cfg).await {
        Ok(bundle) => {
            let btc = bundle.strategy(Asset::Btc).map(|s| s.window).unwrap_or_default();
            let eth = bundle.strategy(Asset::Eth).map(|s| s.window).unwrap_or_default();
            info!(
                target: RUN_LOG_TARGET,
                "pipeline success: BTC MA{btc}, ETH MA{eth}, {} portfolios -> {} ({:.1}s)",
                bundle.portfolios.len(),
                cfg.results.display(),
                t0.elapsed().as_secs_f64()
            );
            Ok(bundle)
        }
        Err(e) => Err(log_failure(e)),
    }
}

async fn run_inner<S: PriceSource>(source: &S, cfg: &PipelineConfig) -> Result<ResultBundle> {
    let prices = fetch_aligned(source, cfg.start, cfg.end).await?;
    let bundle = compute(&prices, cfg)?;
    report::write_bundle(&cfg.results, &cfg.lock_file, &bundle)
        .with_context(|| format!("write {}", cfg.results.display()))?;
    Ok(bundle)
}

/// Optimizes both assets and combines the chosen strategies into the configured blends.
pub fn compute(prices: &AlignedPrices, cfg: &PipelineConfig) -> Result<ResultBundle> {
    let btc = optimize(&prices.btc, &cfg.windows, cfg.objective)?;
    let eth = optimize(&prices.eth, &cfg.windows, cfg.objective)?;
    let blends = portfolio::combine(&btc.best, &eth.best, &cfg.blends, cfg.rebalance)?;

    let dates = prices.dates();
    let data_period = match (dates.first(), dates.last()) {
        (Some(start), Some(end)) => DataPeriod {
            start: *start,
            end: *end,
        },
        _ => anyhow::bail!("no aligned price data"),
    };

    let mut strategies = BTreeMap::new();
    for opt in [&btc, &eth] {
        strategies.insert(opt.asset, StrategyResult::new(opt, prices));
    }

    Ok(ResultBundle {
        generated_at: Utc::now(),
        data_period,
        config: cfg.clone(),
        strategies,
        portfolios: blends
            .iter()
            .map(|c| PortfolioResult::new(c, btc.best.window, eth.best.window))
            .collect(),
    })
}
