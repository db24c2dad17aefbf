use anyhow::{Result, bail};
use chrono::NaiveDate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Objective;
use crate::metrics::{EquityPoint, PerformanceMetrics};
use crate::series::{Asset, PriceSeries};

/// Trailing simple moving average; `None` until `w` values are available.
pub fn rolling_ma(x: &[f64], w: usize) -> Vec<Option<f64>> {
    if w == 0 {
        return vec![None; x.len()];
    }
    let mut out = vec![None; x.len()];
    let mut sum = 0.0;
    for i in 0..x.len() {
        sum += x[i];
        if i >= w {
            sum -= x[i - w];
        }
        if i + 1 >= w {
            out[i] = Some(sum / w as f64);
        }
    }
    out
}

/// Simple day-over-day returns; the first element is 0.
pub fn daily_returns(close: &[f64]) -> Vec<f64> {
    std::iter::once(0.0)
        .chain(
            close
                .iter()
                .tuple_windows()
                .map(|(prev, next)| (next - prev) / prev),
        )
        .take(close.len())
        .collect()
}

/// Latest long/flat reading of the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    Long,
    Flat,
    InsufficientData,
}

impl Signal {
    pub fn label(&self) -> &'static str {
        match self {
            Signal::Long => "LONG",
            Signal::Flat => "FLAT (cash)",
            Signal::InsufficientData => "insufficient data",
        }
    }
}

/// Compares the last close with its `w`-day moving average.
pub fn current_signal(close: &[f64], w: usize) -> Signal {
    if w == 0 || close.len() < w + 1 {
        return Signal::InsufficientData;
    }
    match rolling_ma(close, w).last().copied().flatten() {
        Some(ma) if close[close.len() - 1] > ma => Signal::Long,
        Some(_) => Signal::Flat,
        None => Signal::InsufficientData,
    }
}

/// Long/flat backtest of one window over one series.
///
/// Evaluation begins at the first date with a defined MA. The signal seen at
/// the close of day `i` sets the position held over day `i+1`, so the first
/// evaluated day is always flat with a zero return.
#[derive(Debug, Clone, PartialEq)]
pub struct Backtest {
    pub window: usize,
    pub dates: Vec<NaiveDate>,
    /// 1.0 when long over the day, 0.0 when in cash
    pub positions: Vec<f64>,
    pub returns: Vec<f64>,
    pub equity: Vec<f64>,
}

impl Backtest {
    pub fn run(series: &PriceSeries, w: usize) -> Option<Self> {
        if w == 0 || series.len() < w + 1 {
            return None;
        }
        let ma = rolling_ma(&series.close, w);
        let start = w - 1;
        let close = &series.close[start..];
        let signal: Vec<f64> = close
            .iter()
            .zip(&ma[start..])
            .map(|(c, m)| match m {
                Some(m) if c > m => 1.0,
                _ => 0.0,
            })
            .collect();

        let price_ret = daily_returns(close);
        let mut positions = vec![0.0; close.len()];
        let mut returns = vec![0.0; close.len()];
        let mut equity = vec![1.0; close.len()];
        for i in 1..close.len() {
            positions[i] = signal[i - 1];
            returns[i] = positions[i] * price_ret[i];
            equity[i] = equity[i - 1] * (1.0 + returns[i]);
        }

        Some(Self {
            window: w,
            dates: series.dates[start..].to_vec(),
            positions,
            returns,
            equity,
        })
    }

    pub fn cumulative_return(&self) -> f64 {
        self.equity.last().copied().unwrap_or(1.0) - 1.0
    }

    pub fn curve(&self) -> Vec<EquityPoint> {
        self.dates
            .iter()
            .zip(&self.equity)
            .map(|(date, value)| EquityPoint {
                date: *date,
                value: *value,
            })
            .collect()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics::compute(&self.curve(), &self.returns)
    }
}

/// One row of the window sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowScore {
    pub window: usize,
    pub cumulative_return: f64,
    pub combined_sortino: Option<f64>,
}

impl WindowScore {
    fn objective_value(&self, objective: Objective) -> f64 {
        match objective {
            Objective::CumulativeReturn => self.cumulative_return,
            Objective::CombinedSortino => self.combined_sortino.unwrap_or(f64::NEG_INFINITY),
        }
    }
}

/// Winner of the sweep for one asset, with the backtest it came from.
#[derive(Debug, Clone)]
pub struct Optimized {
    pub asset: Asset,
    pub best: Backtest,
    pub candidates: Vec<WindowScore>,
}

/// Runs every window and keeps the one with the strictly highest objective.
/// Windows are visited in ascending order, so ties resolve to the smaller window.
pub fn optimize(series: &PriceSeries, windows: &[usize], objective: Objective) -> Result<Optimized> {
    let mut sorted = windows.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut best: Option<(f64, Backtest)> = None;
    let mut candidates = Vec::with_capacity(sorted.len());
    for w in sorted {
        let Some(bt) = Backtest::run(series, w) else {
            warn!(
                "{}: skipping MA{} (only {} days, need {})",
                series.asset,
                w,
                series.len(),
                w + 1
            );
            continue;
        };
        let score = WindowScore {
            window: w,
            cumulative_return: bt.cumulative_return(),
            combined_sortino: crate::metrics::combined_sortino(&bt.returns),
        };
        let value = score.objective_value(objective);
        debug!("{} MA{} -> {:.4}", series.asset, w, value);
        candidates.push(score);

        let better = match &best {
            None => true,
            Some((v, _)) => value > *v,
        };
        if better {
            best = Some((value, bt));
        }
    }

    let Some((value, best)) = best else {
        bail!(
            "{}: not enough data for any window ({} days)",
            series.asset,
            series.len()
        );
    };
    info!(
        "{}: best MA{} ({} = {:.4}) out of {} windows",
        series.asset,
        best.window,
        objective.label(),
        value,
        candidates.len()
    );
    Ok(Optimized {
        asset: series.asset,
        best,
        candidates,
    })
}
