use anyhow::{Context, Result, anyhow};
use plotters::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::DashboardArgs;
use crate::config::PipelineConfig;
use crate::fetch::{PriceSource, Source};
use crate::metrics::{PeriodPerformance, period_performance};
use crate::pipeline;
use crate::report::{self, PortfolioResult, ResultBundle, StrategyResult};
use crate::series::Asset;

const CHART_FILE: &str = "equity_curves.svg";

/// Loads the bundle (refreshing it first when asked) and renders it.
pub async fn execute(args: &DashboardArgs) -> Result<()> {
    let cfg = args.pipeline.resolve()?;
    if args.refresh {
        let mut stdout = std::io::stdout();
        match Source::from_config(&cfg).map_err(pipeline::log_failure) {
            Ok(source) => refresh(&source, &cfg, &mut stdout).await?,
            Err(e) => report_refresh(Err(e), &mut stdout)?,
        };
    }

    let mut stdout = std::io::stdout().lock();
    let bundle = show(&cfg.results, &mut stdout)?;

    if !args.no_chart {
        let chart = args.chart.clone().unwrap_or_else(|| chart_path_for(&cfg.results));
        render_chart(&bundle, &chart)?;
        writeln!(stdout, "📈 Equity chart: {}", chart.display())?;
    }
    Ok(())
}

/// Re-runs the pipeline in the foreground. Returns whether a new bundle was
/// written; a failed refresh is reported and the previous bundle is kept.
pub async fn refresh<S: PriceSource>(
    source: &S,
    cfg: &PipelineConfig,
    out: &mut impl Write,
) -> Result<bool> {
    writeln!(out, "🔄 Refreshing results ...")?;
    let outcome = pipeline::run(source, cfg).await.map(|_| ());
    report_refresh(outcome, out)
}

fn report_refresh(outcome: Result<()>, out: &mut impl Write) -> Result<bool> {
    let refreshed = match outcome {
        Ok(()) => {
            writeln!(out, "✅ Refresh complete")?;
            true
        }
        Err(e) => {
            error!("refresh failed: {e:#}");
            writeln!(out, "❌ Refresh failed: {e:#}")?;
            writeln!(out, "   Showing the previous results.")?;
            false
        }
    };
    writeln!(out)?;
    Ok(refreshed)
}

/// Loads the result file and renders it.
pub fn show(results: &Path, out: &mut impl Write) -> Result<ResultBundle> {
    let bundle = report::load_bundle(results)?;
    render(&bundle, out)?;
    Ok(bundle)
}

/// `equity_curves.svg` next to the result file.
pub fn chart_path_for(results: &Path) -> PathBuf {
    results.with_file_name(CHART_FILE)
}

fn pct(x: f64) -> String {
    format!("{:.2}%", x * 100.0)
}

fn opt_pct(p: Option<PeriodPerformance>, f: impl Fn(&PeriodPerformance) -> f64) -> String {
    p.map(|p| pct(f(&p))).unwrap_or_else(|| "n/a".to_string())
}

fn ratio(x: Option<f64>) -> String {
    x.map(|v| format!("{v:.2}")).unwrap_or_else(|| "n/a".to_string())
}

pub fn render(bundle: &ResultBundle, out: &mut impl Write) -> Result<()> {
    writeln!(out, "🎯 BTC/ETH MOVING-AVERAGE STRATEGIES")?;
    writeln!(out, "{}", "=".repeat(80))?;
    writeln!(
        out,
        "Generated: {}",
        bundle.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    )?;
    writeln!(
        out,
        "Data period: {} .. {}",
        bundle.data_period.start, bundle.data_period.end
    )?;
    writeln!(
        out,
        "Rebalancing: {} | Objective: {} | Windows: {}",
        bundle.config.rebalance.label(),
        bundle.config.objective.label(),
        window_range(&bundle.config.windows)
    )?;
    writeln!(out)?;

    for asset in Asset::ALL {
        if let Some(s) = bundle.strategy(asset) {
            strategy_card(s, out)?;
        }
    }

    portfolio_table(&bundle.portfolios, out)?;

    for asset in Asset::ALL {
        if let Some(s) = bundle.strategy(asset) {
            candidate_table(s, out)?;
        }
    }
    Ok(())
}

fn window_range(windows: &[usize]) -> String {
    match (windows.first(), windows.last()) {
        (Some(a), Some(b)) if a != b => format!("MA{a}..MA{b} ({} candidates)", windows.len()),
        (Some(a), _) => format!("MA{a}"),
        _ => "none".to_string(),
    }
}

fn strategy_card(s: &StrategyResult, out: &mut impl Write) -> Result<()> {
    writeln!(out, "📊 {} strategy: MA{}", s.asset, s.window)?;
    writeln!(out, "   Signal: {}", s.signal.label())?;
    writeln!(out, "   Total Return: {}", pct(s.cumulative_return))?;
    writeln!(out, "   CAGR: {}", pct(s.metrics.cagr))?;
    writeln!(out, "   Max Drawdown: {}", pct(s.metrics.max_drawdown))?;
    writeln!(out, "   Sharpe Ratio: {:.2}", s.metrics.sharpe)?;
    writeln!(out, "   Combined Sortino: {}", ratio(s.metrics.combined_sortino))?;
    writeln!(out)?;
    Ok(())
}

fn portfolio_table(portfolios: &[PortfolioResult], out: &mut impl Write) -> Result<()> {
    writeln!(out, "💼 PORTFOLIOS")?;
    writeln!(
        out,
        "{:<20} {:>12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8}  {}",
        "Portfolio",
        "Final",
        "CAGR",
        "MDD",
        "5y CAGR",
        "5y MDD",
        "1y CAGR",
        "1y MDD",
        "Sharpe",
        "Signal"
    )?;
    writeln!(out, "{}", "-".repeat(132))?;
    for p in portfolios {
        let five = period_performance(&p.equity_curve, 5);
        let one = period_performance(&p.equity_curve, 1);
        writeln!(
            out,
            "{:<20} {:>12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8.2}  {} (MA{})",
            p.label,
            format!("{:.2}x", p.metrics.final_value),
            pct(p.metrics.cagr),
            pct(p.metrics.max_drawdown),
            opt_pct(five, |x| x.cagr),
            opt_pct(five, |x| x.max_drawdown),
            opt_pct(one, |x| x.cagr),
            opt_pct(one, |x| x.max_drawdown),
            p.metrics.sharpe,
            p.signal.label(),
            p.signal_window
        )?;
    }
    if let Some(p) = portfolios.iter().find(|p| p.rebalanced) {
        writeln!(out, "   {} rebalances in {}", p.rebalance_count, p.label)?;
    }
    writeln!(out)?;
    Ok(())
}

fn candidate_table(s: &StrategyResult, out: &mut impl Write) -> Result<()> {
    writeln!(out, "🔍 {} window sweep", s.asset)?;
    writeln!(out, "{:<8} {:>14} {:>18}", "Window", "Total Ret%", "Combined Sortino")?;
    writeln!(out, "{}", "-".repeat(42))?;
    for c in &s.candidates {
        let marker = if c.window == s.window { " ◀" } else { "" };
        writeln!(
            out,
            "{:<8} {:>14.2} {:>18}{}",
            format!("MA{}", c.window),
            c.cumulative_return * 100.0,
            ratio(c.combined_sortino),
            marker
        )?;
    }
    writeln!(out)?;
    Ok(())
}

fn color_for(key: &str, idx: usize) -> RGBColor {
    match key {
        "BTC" => RGBColor(247, 147, 26),
        "ETH" => RGBColor(98, 126, 234),
        "Rebal_50_50" => RGBColor(16, 185, 129),
        "Rebal_60_40" => RGBColor(139, 92, 246),
        _ => [RGBColor(239, 68, 68), RGBColor(100, 116, 139), RGBColor(234, 179, 8)][idx % 3],
    }
}

/// SVG of every portfolio's equity curve on a log scale.
pub fn render_chart(bundle: &ResultBundle, path: &Path) -> Result<()> {
    let (start, end) = (bundle.data_period.start, bundle.data_period.end);
    let values = || {
        bundle
            .portfolios
            .iter()
            .flat_map(|p| p.equity_curve.iter().map(|e| e.value))
            .filter(|v| *v > 0.0)
    };
    let lo = values().fold(f64::INFINITY, f64::min);
    let hi = values().fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() || !hi.is_finite() || end <= start {
        return Err(anyhow!("nothing to chart"));
    }
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }

    let root = SVGBackend::new(path, (1280, 720)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Portfolio equity (start = 1.0)", ("sans-serif", 24))
        .margin(12)
        .x_label_area_size(30)
        .y_label_area_size(60)
        .build_cartesian_2d(start..end, (lo * 0.9..hi * 1.1).log_scale())?;
    chart
        .configure_mesh()
        .y_desc("value")
        .x_labels(10)
        .draw()?;

    for (idx, p) in bundle.portfolios.iter().enumerate() {
        let color = color_for(&p.key, idx);
        chart
            .draw_series(LineSeries::new(
                p.equity_curve.iter().map(|e| (e.date, e.value.max(lo))),
                color.stroke_width(2),
            ))?
            .label(p.label.clone())
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
            });
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()
        .map_err(|e| anyhow!("unable to write {}: {e}", path.display()))?;
    info!("wrote chart {}", path.display());
    Ok(())
}
