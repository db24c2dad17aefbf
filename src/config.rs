use anyhow::{Context, Result, bail};
use chrono::{Datelike, NaiveDate, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf};

use crate::PipelineArgs;

pub const DEFAULT_RESULTS: &str = "data/strategy_results.json";
pub const DEFAULT_START: &str = "2016-01-01";
pub const DEFAULT_VS: &str = "usd";
pub const DEFAULT_BLENDS: [f64; 2] = [0.5, 0.6];
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 2_500;

/// Candidate MA windows: 10, 20, ..., 200 days.
pub fn default_windows() -> Vec<usize> {
    (10..=200).step_by(10).collect()
}

/// How often the blended portfolios are reset to their target weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RebalancePeriod {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Quarterly,
    Yearly,
}

impl RebalancePeriod {
    /// Period bucket a date falls into; a change of bucket between two
    /// consecutive trading dates marks a rebalance.
    pub fn bucket(&self, date: NaiveDate) -> (i32, u32) {
        match self {
            RebalancePeriod::Daily => (date.year(), date.ordinal()),
            RebalancePeriod::Weekly => {
                let w = date.iso_week();
                (w.year(), w.week())
            }
            RebalancePeriod::Monthly => (date.year(), date.month()),
            RebalancePeriod::Quarterly => (date.year(), (date.month() - 1) / 3),
            RebalancePeriod::Yearly => (date.year(), 0),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RebalancePeriod::Daily => "daily",
            RebalancePeriod::Weekly => "weekly",
            RebalancePeriod::Monthly => "monthly",
            RebalancePeriod::Quarterly => "quarterly",
            RebalancePeriod::Yearly => "yearly",
        }
    }
}

/// What the window sweep maximises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Objective {
    #[default]
    CumulativeReturn,
    CombinedSortino,
}

impl Objective {
    pub fn label(&self) -> &'static str {
        match self {
            Objective::CumulativeReturn => "cumulative return",
            Objective::CombinedSortino => "combined sortino (30% full / 40% 3y / 30% 1y)",
        }
    }
}

/// One portfolio of the combiner: fixed BTC/ETH target weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendSpec {
    pub key: String,
    pub label: String,
    pub btc_weight: f64,
    pub eth_weight: f64,
    pub rebalanced: bool,
}

impl BlendSpec {
    pub fn solo(asset: crate::series::Asset) -> Self {
        let (btc_weight, eth_weight) = match asset {
            crate::series::Asset::Btc => (1.0, 0.0),
            crate::series::Asset::Eth => (0.0, 1.0),
        };
        Self {
            key: asset.symbol().to_string(),
            label: format!("{} only", asset.symbol()),
            btc_weight,
            eth_weight,
            rebalanced: false,
        }
    }

    pub fn rebalanced(btc_weight: f64) -> Self {
        let btc_pct = (btc_weight * 100.0).round() as u32;
        let eth_pct = 100 - btc_pct;
        Self {
            key: format!("Rebal_{btc_pct}_{eth_pct}"),
            label: format!("{btc_pct}/{eth_pct} rebalanced"),
            btc_weight,
            eth_weight: 1.0 - btc_weight,
            rebalanced: true,
        }
    }
}

/// Fully resolved pipeline settings. Embedded in the result bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub windows: Vec<usize>,
    pub rebalance: RebalancePeriod,
    pub objective: Objective,
    pub blends: Vec<BlendSpec>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub vs: String,
    #[serde(skip)]
    pub results: PathBuf,
    #[serde(skip)]
    pub lock_file: PathBuf,
    #[serde(skip)]
    pub prices_csv: Option<PathBuf>,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(skip)]
    pub demo_api_key: Option<String>,
    #[serde(skip)]
    pub request_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let results = PathBuf::from(DEFAULT_RESULTS);
        Self {
            windows: default_windows(),
            rebalance: RebalancePeriod::default(),
            objective: Objective::default(),
            blends: default_blends(&DEFAULT_BLENDS),
            start: NaiveDate::from_ymd_opt(2016, 1, 1).unwrap_or_default(),
            end: Utc::now().date_naive(),
            vs: DEFAULT_VS.to_string(),
            lock_file: lock_path_for(&results),
            results,
            prices_csv: None,
            api_key: None,
            demo_api_key: None,
            request_delay_ms: DEFAULT_REQUEST_DELAY_MS,
        }
    }
}

fn default_blends(btc_weights: &[f64]) -> Vec<BlendSpec> {
    let mut blends = vec![
        BlendSpec::solo(crate::series::Asset::Btc),
        BlendSpec::solo(crate::series::Asset::Eth),
    ];
    blends.extend(btc_weights.iter().map(|w| BlendSpec::rebalanced(*w)));
    blends
}

/// `<results>.lock` next to the result file.
pub fn lock_path_for(results: &std::path::Path) -> PathBuf {
    let mut name = results.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    results.with_file_name(name)
}

fn parse_date(s: &str, flag: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid --{flag} {s:?}"))
}

impl PipelineArgs {
    /// Fills unset flags with defaults and validates the result.
    pub fn resolve(&self) -> Result<PipelineConfig> {
        let results = self
            .results
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS));
        let lock_file = self
            .lock_file
            .clone()
            .unwrap_or_else(|| lock_path_for(&results));

        let start = parse_date(self.start.as_deref().unwrap_or(DEFAULT_START), "start")?;
        let end = match &self.end {
            Some(s) => parse_date(s, "end")?,
            None => Utc::now().date_naive(),
        };
        if end <= start {
            bail!("end ({end}) must be after start ({start})");
        }

        let mut windows = self.windows.clone().unwrap_or_else(default_windows);
        windows.sort_unstable();
        windows.dedup();
        if windows.is_empty() {
            bail!("--windows needs at least one window");
        }
        if windows.contains(&0) {
            bail!("--windows must be positive");
        }

        let btc_weights = self.blends.clone().unwrap_or_else(|| DEFAULT_BLENDS.to_vec());
        if let Some(w) = btc_weights.iter().find(|w| !(0.0..=1.0).contains(*w)) {
            bail!("--blends weight {w} is outside 0..=1");
        }

        let api_key = self
            .api_key
            .clone()
            .or_else(|| env::var("CG_PRO_API_KEY").ok())
            .filter(|k| !k.trim().is_empty());
        let demo_api_key = self
            .demo_api_key
            .clone()
            .or_else(|| env::var("CG_DEMO_API_KEY").ok())
            .filter(|k| !k.trim().is_empty());

        Ok(PipelineConfig {
            windows,
            rebalance: self.rebalance.unwrap_or_default(),
            objective: self.objective.unwrap_or_default(),
            blends: default_blends(&btc_weights),
            start,
            end,
            vs: self.vs.clone().unwrap_or_else(|| DEFAULT_VS.to_string()),
            results,
            lock_file,
            prices_csv: self.prices_csv.clone(),
            api_key,
            demo_api_key,
            request_delay_ms: self.request_delay_ms.unwrap_or(DEFAULT_REQUEST_DELAY_MS),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn defaults_resolve() {
        let cfg = PipelineArgs {
            end: Some("2024-06-30".into()),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(cfg.windows.first(), Some(&10));
        assert_eq!(cfg.windows.last(), Some(&200));
        assert_eq!(cfg.windows.len(), 20);
        assert_eq!(cfg.rebalance, RebalancePeriod::Monthly);
        assert_eq!(cfg.objective, Objective::CumulativeReturn);
        let keys: Vec<_> = cfg.blends.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, ["BTC", "ETH", "Rebal_50_50", "Rebal_60_40"]);
        assert_eq!(cfg.lock_file, PathBuf::from("data/strategy_results.json.lock"));
    }

    #[test]
    fn windows_sorted_and_deduped() {
        let cfg = PipelineArgs {
            end: Some("2024-06-30".into()),
            windows: Some(vec![50, 20, 50, 30]),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(cfg.windows, vec![20, 30, 50]);
    }

    #[test]
    fn rejects_bad_input() {
        let base = PipelineArgs {
            end: Some("2024-06-30".into()),
            ..Default::default()
        };
        let zero = PipelineArgs {
            windows: Some(vec![0, 10]),
            ..base.clone()
        };
        assert!(zero.resolve().is_err());
        let weight = PipelineArgs {
            blends: Some(vec![1.5]),
            ..base.clone()
        };
        assert!(weight.resolve().is_err());
        let order = PipelineArgs {
            start: Some("2024-07-01".into()),
            ..base
        };
        assert!(order.resolve().is_err());
    }

    #[test]
    fn rebalance_buckets() {
        let m = RebalancePeriod::Monthly;
        assert_eq!(m.bucket(date(2024, 1, 31)), m.bucket(date(2024, 1, 1)));
        assert_ne!(m.bucket(date(2024, 1, 31)), m.bucket(date(2024, 2, 1)));

        let q = RebalancePeriod::Quarterly;
        assert_eq!(q.bucket(date(2024, 1, 5)), q.bucket(date(2024, 3, 31)));
        assert_ne!(q.bucket(date(2024, 3, 31)), q.bucket(date(2024, 4, 1)));

        // 2024-12-30 belongs to ISO week 1 of 2025
        let w = RebalancePeriod::Weekly;
        assert_eq!(w.bucket(date(2024, 12, 30)), w.bucket(date(2025, 1, 5)));
        assert_ne!(w.bucket(date(2025, 1, 5)), w.bucket(date(2025, 1, 6)));
    }

    #[test]
    fn blend_keys_follow_weights() {
        let b = BlendSpec::rebalanced(0.6);
        assert_eq!(b.key, "Rebal_60_40");
        assert!((b.eth_weight - 0.4).abs() < 1e-12);
    }
}
