use anyhow::{Result, bail};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::info;

use crate::config::{BlendSpec, RebalancePeriod};
use crate::metrics::{EquityPoint, PerformanceMetrics};
use crate::strategy::Backtest;

/// Chosen-window strategy returns of both assets on their common dates.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedReturns {
    pub dates: Vec<NaiveDate>,
    pub btc: Vec<f64>,
    pub eth: Vec<f64>,
}

impl AlignedReturns {
    /// Keeps the dates both backtests evaluated. The first common date is the
    /// starting point of every portfolio, so its return is never applied.
    pub fn from_backtests(btc: &Backtest, eth: &Backtest) -> Result<Self> {
        let eth_by_date: BTreeMap<NaiveDate, f64> = eth
            .dates
            .iter()
            .copied()
            .zip(eth.returns.iter().copied())
            .collect();
        let mut out = Self {
            dates: Vec::new(),
            btc: Vec::new(),
            eth: Vec::new(),
        };
        for (d, rb) in btc.dates.iter().zip(&btc.returns) {
            if let Some(re) = eth_by_date.get(d) {
                out.dates.push(*d);
                out.btc.push(*rb);
                out.eth.push(*re);
            }
        }
        if out.dates.len() < 2 {
            bail!(
                "BTC MA{} and ETH MA{} backtests share fewer than two dates",
                btc.window,
                eth.window
            );
        }
        Ok(out)
    }
}

/// Equity of one blend over the aligned dates.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendCurve {
    pub spec: BlendSpec,
    pub curve: Vec<EquityPoint>,
    pub returns: Vec<f64>,
    pub rebalance_dates: Vec<NaiveDate>,
}

impl BlendCurve {
    pub fn metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics::compute(&self.curve, &self.returns)
    }
}

/// Simulates a two-asset portfolio starting at 1.0.
///
/// Sleeves grow with their strategy returns and the weights drift. On the
/// first date of each new rebalance period (after that day's growth) the
/// weights are reset to target. Unrebalanced blends just drift; with a zero
/// weight on one side this is the solo curve.
pub fn simulate(returns: &AlignedReturns, spec: &BlendSpec, period: RebalancePeriod) -> BlendCurve {
    let n = returns.dates.len();
    let mut values = vec![1.0; n];
    let mut rebalance_dates = Vec::new();
    let (mut w_btc, mut w_eth) = (spec.btc_weight, spec.eth_weight);

    for i in 1..n {
        let prev = values[i - 1];
        if prev <= 0.0 {
            values[i] = prev;
            continue;
        }
        let btc_sleeve = prev * w_btc * (1.0 + returns.btc[i]);
        let eth_sleeve = prev * w_eth * (1.0 + returns.eth[i]);
        let total = btc_sleeve + eth_sleeve;
        values[i] = total.max(0.0);
        if total <= 0.0 {
            continue;
        }

        let new_period = period.bucket(returns.dates[i]) != period.bucket(returns.dates[i - 1]);
        if spec.rebalanced && new_period {
            w_btc = spec.btc_weight;
            w_eth = spec.eth_weight;
            rebalance_dates.push(returns.dates[i]);
        } else {
            w_btc = btc_sleeve / total;
            w_eth = eth_sleeve / total;
        }
    }

    let curve: Vec<EquityPoint> = returns
        .dates
        .iter()
        .zip(&values)
        .map(|(date, value)| EquityPoint {
            date: *date,
            value: *value,
        })
        .collect();
    let mut daily = vec![0.0; n];
    for i in 1..n {
        if values[i - 1] > 0.0 {
            daily[i] = values[i] / values[i - 1] - 1.0;
        }
    }

    BlendCurve {
        spec: spec.clone(),
        curve,
        returns: daily,
        rebalance_dates,
    }
}

/// Builds every configured blend from the two chosen-window backtests.
pub fn combine(
    btc: &Backtest,
    eth: &Backtest,
    blends: &[BlendSpec],
    period: RebalancePeriod,
) -> Result<Vec<BlendCurve>> {
    let aligned = AlignedReturns::from_backtests(btc, eth)?;
    info!(
        "combining {} portfolios over {} days ({} .. {}), {} rebalancing",
        blends.len(),
        aligned.dates.len(),
        aligned.dates[0],
        aligned.dates[aligned.dates.len() - 1],
        period.label()
    );
    Ok(blends
        .iter()
        .map(|spec| simulate(&aligned, spec, period))
        .collect())
}
