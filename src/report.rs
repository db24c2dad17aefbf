use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt; // for file locking
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::info;

use crate::config::PipelineConfig;
use crate::metrics::{EquityPoint, PerformanceMetrics};
use crate::portfolio::BlendCurve;
use crate::series::{AlignedPrices, Asset};
use crate::strategy::{Optimized, Signal, WindowScore, current_signal};

/// Chosen window and its backtest for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyResult {
    pub asset: Asset,
    pub window: usize,
    pub cumulative_return: f64,
    pub signal: Signal,
    pub metrics: PerformanceMetrics,
    pub candidates: Vec<WindowScore>,
    pub equity_curve: Vec<EquityPoint>,
}

impl StrategyResult {
    pub fn new(opt: &Optimized, prices: &AlignedPrices) -> Self {
        let close = &prices.series(opt.asset).close;
        Self {
            asset: opt.asset,
            window: opt.best.window,
            cumulative_return: opt.best.cumulative_return(),
            signal: current_signal(close, opt.best.window),
            metrics: opt.best.metrics(),
            candidates: opt.candidates.clone(),
            equity_curve: opt.best.curve(),
        }
    }
}

/// One blend (solo or rebalanced) of the two chosen strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioResult {
    pub key: String,
    pub label: String,
    pub btc_weight: f64,
    pub eth_weight: f64,
    pub rebalanced: bool,
    pub cumulative_return: f64,
    pub rebalance_count: usize,
    /// Last equity value against its MA over `signal_window` days.
    pub signal: Signal,
    pub signal_window: usize,
    pub metrics: PerformanceMetrics,
    pub equity_curve: Vec<EquityPoint>,
}

impl PortfolioResult {
    /// The blend's signal uses the chosen window of its heavier asset (BTC on
    /// a tie).
    pub fn new(c: &BlendCurve, btc_window: usize, eth_window: usize) -> Self {
        let metrics = c.metrics();
        let signal_window = if c.spec.btc_weight >= c.spec.eth_weight {
            btc_window
        } else {
            eth_window
        };
        let values: Vec<f64> = c.curve.iter().map(|e| e.value).collect();
        Self {
            key: c.spec.key.clone(),
            label: c.spec.label.clone(),
            btc_weight: c.spec.btc_weight,
            eth_weight: c.spec.eth_weight,
            rebalanced: c.spec.rebalanced,
            cumulative_return: metrics.cumulative_return,
            rebalance_count: c.rebalance_dates.len(),
            signal: current_signal(&values, signal_window),
            signal_window,
            metrics,
            equity_curve: c.curve.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Everything one pipeline run produces. Written whole, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub generated_at: DateTime<Utc>,
    pub data_period: DataPeriod,
    pub config: PipelineConfig,
    pub strategies: BTreeMap<Asset, StrategyResult>,
    pub portfolios: Vec<PortfolioResult>,
}

impl ResultBundle {
    pub fn strategy(&self, asset: Asset) -> Option<&StrategyResult> {
        self.strategies.get(&asset)
    }
}

/// Acquire an exclusive file lock; keep the file handle alive to hold the lock.
pub fn acquire_lock(lock_path: &Path) -> Result<fs::File> {
    if let Some(dir) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(dir).ok();
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("open lock file {}", lock_path.display()))?;
    file.lock_exclusive()?;
    Ok(file)
}

/// Replaces `path` with the serialized bundle: the JSON goes to a temp file in
/// the same directory and is renamed over the target, so readers see either
/// the old file or the new one.
pub fn write_bundle(path: &Path, lock_path: &Path, bundle: &ResultBundle) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir).context("create result dir")?;

    let _lock_guard = acquire_lock(lock_path)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), bundle)?;
    tmp.as_file_mut().write_all(b"\n")?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;

    info!("wrote {}", path.display());
    Ok(())
}

pub fn load_bundle(path: &Path) -> Result<ResultBundle> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read {} (run the pipeline first)", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlendSpec;

    fn sample_bundle() -> ResultBundle {
        let d = |s: &str| s.parse::<NaiveDate>().unwrap();
        let curve = vec![
            EquityPoint {
                date: d("2024-01-01"),
                value: 1.0,
            },
            EquityPoint {
                date: d("2024-01-02"),
                value: 1.05,
            },
        ];
        let metrics = PerformanceMetrics::compute(&curve, &[0.0, 0.05]);
        let strategy = |asset| StrategyResult {
            asset,
            window: 20,
            cumulative_return: 0.05,
            signal: Signal::Long,
            metrics: metrics.clone(),
            candidates: vec![WindowScore {
                window: 20,
                cumulative_return: 0.05,
                combined_sortino: None,
            }],
            equity_curve: curve.clone(),
        };
        let spec = BlendSpec::rebalanced(0.5);
        ResultBundle {
            generated_at: "2024-01-03T09:00:00Z".parse().unwrap(),
            data_period: DataPeriod {
                start: d("2023-12-01"),
                end: d("2024-01-02"),
            },
            config: PipelineConfig::default(),
            strategies: [(Asset::Btc, strategy(Asset::Btc)), (Asset::Eth, strategy(Asset::Eth))]
                .into_iter()
                .collect(),
            portfolios: vec![PortfolioResult {
                key: spec.key.clone(),
                label: spec.label.clone(),
                btc_weight: 0.5,
                eth_weight: 0.5,
                rebalanced: true,
                cumulative_return: 0.05,
                rebalance_count: 0,
                signal: Signal::Long,
                signal_window: 20,
                metrics,
                equity_curve: curve,
            }],
        }
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("strategy_results.json");
        let lock = dir.path().join("data").join("strategy_results.json.lock");
        let bundle = sample_bundle();
        write_bundle(&path, &lock, &bundle).unwrap();

        let loaded = load_bundle(&path).unwrap();
        assert_eq!(loaded.strategies, bundle.strategies);
        assert_eq!(loaded.portfolios, bundle.portfolios);
        assert_eq!(loaded.config.windows, bundle.config.windows);
        let rebal = loaded.portfolios.iter().find(|p| p.key == "Rebal_50_50").unwrap();
        assert_eq!(rebal.btc_weight, 0.5);
        assert_eq!(rebal.signal, Signal::Long);
    }

    #[test]
    fn write_overwrites_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.json");
        let lock = dir.path().join("r.json.lock");
        fs::write(&path, "{\"stale\": true, \"padding\": \"".to_string() + &"x".repeat(50_000) + "\"}")
            .unwrap();
        write_bundle(&path, &lock, &sample_bundle()).unwrap();
        assert!(load_bundle(&path).is_ok());
        // only the result file and its lock remain
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn json_uses_symbol_keys_and_kebab_signals() {
        let json = serde_json::to_value(sample_bundle()).unwrap();
        assert!(json["strategies"]["BTC"].is_object());
        assert_eq!(json["strategies"]["ETH"]["signal"], "long");
        assert_eq!(json["config"]["rebalance"], "monthly");
        assert_eq!(json["config"]["objective"], "cumulative-return");
        assert!(json["strategies"]["BTC"]["metrics"]["sortino"].is_null());
    }

    fn blend(spec: BlendSpec, values: &[f64]) -> BlendCurve {
        let start = "2024-01-01".parse::<NaiveDate>().unwrap();
        let curve: Vec<EquityPoint> = values
            .iter()
            .enumerate()
            .map(|(i, &value)| EquityPoint {
                date: start + chrono::Duration::days(i as i64),
                value,
            })
            .collect();
        let returns = std::iter::once(0.0)
            .chain(values.windows(2).map(|w| w[1] / w[0] - 1.0))
            .collect();
        BlendCurve {
            spec,
            curve,
            returns,
            rebalance_dates: Vec::new(),
        }
    }

    #[test]
    fn portfolio_signal_follows_its_curve() {
        let rising: Vec<f64> = (0..30).map(|i| 1.0 + i as f64 * 0.01).collect();
        let p = PortfolioResult::new(&blend(BlendSpec::rebalanced(0.6), &rising), 10, 20);
        assert_eq!(p.signal_window, 10);
        assert_eq!(p.signal, Signal::Long);

        let falling: Vec<f64> = rising.iter().rev().copied().collect();
        let p = PortfolioResult::new(&blend(BlendSpec::rebalanced(0.5), &falling), 10, 20);
        assert_eq!(p.signal, Signal::Flat);
    }

    #[test]
    fn portfolio_signal_uses_the_heavier_asset_window() {
        let rising: Vec<f64> = (0..15).map(|i| 1.0 + i as f64 * 0.01).collect();
        // ETH-only blend picks the ETH window, which needs more history than exists
        let p = PortfolioResult::new(&blend(BlendSpec::solo(Asset::Eth), &rising), 5, 20);
        assert_eq!(p.signal_window, 20);
        assert_eq!(p.signal, Signal::InsufficientData);

        let p = PortfolioResult::new(&blend(BlendSpec::solo(Asset::Btc), &rising), 5, 20);
        assert_eq!(p.signal_window, 5);
        assert_eq!(p.signal, Signal::Long);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_bundle(&dir.path().join("nope.json")).is_err());
    }
}
