use anyhow::{Result, bail};
use approx::assert_relative_eq;
use chrono::NaiveDate;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crypto_ma_dashboard::config::{PipelineConfig, lock_path_for};
use crypto_ma_dashboard::fetch::{CsvFile, PriceSource};
use crypto_ma_dashboard::series::{Asset, PriceSeries};
use crypto_ma_dashboard::strategy::Signal;
use crypto_ma_dashboard::{RebalancePeriod, pipeline, report};

fn day(i: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 1, 1).unwrap() + chrono::Duration::days(i as i64)
}

fn write_csv(path: &Path, btc: &[f64], eth: &[f64]) {
    let mut s = String::from("date,btc,eth\n");
    for (i, (b, e)) in btc.iter().zip(eth).enumerate() {
        writeln!(s, "{},{b},{e}", day(i)).unwrap();
    }
    fs::write(path, s).unwrap();
}

fn config(dir: &Path, csv: PathBuf, windows: Vec<usize>, days: usize) -> PipelineConfig {
    let results = dir.join("data").join("strategy_results.json");
    PipelineConfig {
        windows,
        start: day(0),
        end: day(days - 1),
        lock_file: lock_path_for(&results),
        results,
        prices_csv: Some(csv),
        ..Default::default()
    }
}

fn cycle(n: usize, base: f64, amp: f64, period: f64) -> Vec<f64> {
    (0..n)
        .map(|i| base * (1.0 + amp * (i as f64 / period).sin()) * (1.0 + 0.001 * i as f64))
        .collect()
}

struct Unreachable;

impl PriceSource for Unreachable {
    fn name(&self) -> String {
        "unreachable".into()
    }

    async fn fetch(&self, asset: Asset, _start: NaiveDate, _end: NaiveDate) -> Result<PriceSeries> {
        bail!("{asset}: connection refused")
    }
}

#[tokio::test]
async fn run_writes_a_complete_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("prices.csv");
    let n = 400;
    write_csv(&csv, &cycle(n, 30_000.0, 0.2, 20.0), &cycle(n, 2_000.0, 0.3, 13.0));
    let cfg = config(dir.path(), csv.clone(), vec![10, 20, 50], n);

    let bundle = pipeline::run(&CsvFile { path: csv }, &cfg).await.unwrap();
    let loaded = report::load_bundle(&cfg.results).unwrap();

    assert_eq!(loaded.strategies, bundle.strategies);
    assert_eq!(loaded.portfolios, bundle.portfolios);
    assert_eq!(loaded.data_period.start, day(0));
    assert_eq!(loaded.data_period.end, day(n - 1));
    assert_eq!(loaded.config.windows, vec![10, 20, 50]);
    assert_eq!(loaded.config.rebalance, RebalancePeriod::Monthly);

    let keys: Vec<&str> = loaded.portfolios.iter().map(|p| p.key.as_str()).collect();
    assert_eq!(keys, ["BTC", "ETH", "Rebal_50_50", "Rebal_60_40"]);
    for p in &loaded.portfolios {
        assert_eq!(p.equity_curve[0].value, 1.0);
    }

    for asset in Asset::ALL {
        let s = loaded.strategy(asset).unwrap();
        assert!([10, 20, 50].contains(&s.window));
        assert_eq!(s.candidates.len(), 3);
        let best = s
            .candidates
            .iter()
            .map(|c| c.cumulative_return)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(s.cumulative_return, best);
        assert_ne!(s.signal, Signal::InsufficientData);
    }
}

#[tokio::test]
async fn failed_fetch_leaves_result_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), dir.path().join("unused.csv"), vec![10], 100);
    fs::create_dir_all(cfg.results.parent().unwrap()).unwrap();
    let previous = b"{\"previous\": \"run\"}\n";
    fs::write(&cfg.results, previous).unwrap();

    assert!(pipeline::run(&Unreachable, &cfg).await.is_err());
    assert_eq!(fs::read(&cfg.results).unwrap(), previous);
    assert_eq!(fs::read_dir(cfg.results.parent().unwrap()).unwrap().count(), 1);
}

#[tokio::test]
async fn too_little_history_fails_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("prices.csv");
    write_csv(&csv, &[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]);
    let cfg = config(dir.path(), csv.clone(), vec![50, 100], 3);

    assert!(pipeline::run(&CsvFile { path: csv }, &cfg).await.is_err());
    assert!(!cfg.results.exists());
}

#[tokio::test]
async fn rising_prices_follow_the_price_curve() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("prices.csv");
    let n = 120;
    let btc: Vec<f64> = (0..n).map(|i| 100.0 + i as f64).collect();
    let eth: Vec<f64> = (0..n).map(|i| 10.0 + 0.5 * i as f64).collect();
    write_csv(&csv, &btc, &eth);
    let w = 20;
    let cfg = config(dir.path(), csv.clone(), vec![w], n);

    let bundle = pipeline::run(&CsvFile { path: csv }, &cfg).await.unwrap();
    let s = bundle.strategy(Asset::Btc).unwrap();
    assert_eq!(s.signal, Signal::Long);
    assert_eq!(s.equity_curve[0].date, day(w - 1));
    for (k, p) in s.equity_curve.iter().enumerate() {
        assert_relative_eq!(p.value, btc[w - 1 + k] / btc[w - 1], max_relative = 1e-9);
    }
    assert_eq!(s.metrics.max_drawdown, 0.0);
}

#[tokio::test]
async fn identical_assets_give_identical_portfolios() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("prices.csv");
    let n = 300;
    let prices = cycle(n, 1_000.0, 0.25, 9.0);
    write_csv(&csv, &prices, &prices);
    let mut cfg = config(dir.path(), csv.clone(), vec![10, 30, 60], n);
    cfg.rebalance = RebalancePeriod::Weekly;

    let bundle = pipeline::run(&CsvFile { path: csv }, &cfg).await.unwrap();
    assert_eq!(
        bundle.strategy(Asset::Btc).unwrap().window,
        bundle.strategy(Asset::Eth).unwrap().window
    );
    let reference = &bundle.portfolios[0].equity_curve;
    for p in &bundle.portfolios[1..] {
        assert_eq!(p.equity_curve.len(), reference.len());
        for (a, b) in p.equity_curve.iter().zip(reference) {
            assert_eq!(a.date, b.date);
            assert_relative_eq!(a.value, b.value, max_relative = 1e-12);
        }
    }
}
