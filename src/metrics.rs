use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

pub const DAYS_PER_YEAR: f64 = 365.0;
pub const CALENDAR_YEAR_DAYS: f64 = 365.25;

const RECENT_3Y_DAYS: usize = 1095;
const RECENT_1Y_DAYS: usize = 365;

/// One point of an equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Summary statistics of a daily return series and its equity curve.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub final_value: f64,
    pub cumulative_return: f64,
    pub cagr: f64,
    pub sharpe: f64,
    /// `None` when undefined (no downside observations).
    pub sortino: Option<f64>,
    pub combined_sortino: Option<f64>,
    /// Largest peak-to-trough loss, as a positive fraction.
    pub max_drawdown: f64,
    pub volatility: f64,
}

impl PerformanceMetrics {
    /// `returns[i]` is the return that moved `curve[i-1]` to `curve[i]`; `returns[0]` is 0.
    pub fn compute(curve: &[EquityPoint], returns: &[f64]) -> Self {
        let final_value = curve.last().map(|p| p.value).unwrap_or(1.0);
        let years = match (curve.first(), curve.last()) {
            (Some(a), Some(b)) => years_between(a.date, b.date),
            _ => 1.0 / CALENDAR_YEAR_DAYS,
        };
        let sd = sample_std(returns);
        let mean = mean(returns);
        let sharpe = if sd > 0.0 {
            (mean * DAYS_PER_YEAR) / (sd * DAYS_PER_YEAR.sqrt())
        } else {
            0.0
        };
        Self {
            final_value,
            cumulative_return: final_value - 1.0,
            cagr: cagr(final_value, years),
            sharpe,
            sortino: sortino(returns),
            combined_sortino: combined_sortino(returns),
            max_drawdown: max_drawdown(curve.iter().map(|p| p.value)),
            volatility: sd * DAYS_PER_YEAR.sqrt(),
        }
    }
}

fn mean(x: &[f64]) -> f64 {
    if x.is_empty() { 0.0 } else { x.mean() }
}

/// Sample standard deviation (n-1); 0 for fewer than two observations.
pub fn sample_std(x: &[f64]) -> f64 {
    if x.len() < 2 {
        return 0.0;
    }
    let sd = x.std_dev();
    if sd.is_finite() { sd } else { 0.0 }
}

/// Calendar years between two dates, never less than one day.
pub fn years_between(start: NaiveDate, end: NaiveDate) -> f64 {
    ((end - start).num_days() as f64 / CALENDAR_YEAR_DAYS).max(1.0 / CALENDAR_YEAR_DAYS)
}

/// Compound annual growth rate of a growth factor (final / initial).
pub fn cagr(factor: f64, years: f64) -> f64 {
    if factor <= 0.0 {
        return -1.0;
    }
    if years <= 0.0 {
        return 0.0;
    }
    factor.powf(1.0 / years) - 1.0
}

/// Annualised Sortino ratio with a zero target.
pub fn sortino(returns: &[f64]) -> Option<f64> {
    if returns.is_empty() {
        return None;
    }
    let annual_mean = mean(returns) * DAYS_PER_YEAR;
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    let downside_dev = sample_std(&downside) * DAYS_PER_YEAR.sqrt();
    if downside_dev == 0.0 {
        // no measurable downside: unbounded when the mean is positive
        return if annual_mean > 0.0 { None } else { Some(0.0) };
    }
    Some(annual_mean / downside_dev)
}

/// Recency-weighted Sortino: 30% full period, 40% last ~3 years, 30% last year.
/// Undefined components are dropped and the remaining weights renormalised.
pub fn combined_sortino(returns: &[f64]) -> Option<f64> {
    let overall = sortino(returns);
    if returns.len() < 100 {
        return overall;
    }
    let tail = |n: usize| &returns[returns.len() - n.min(returns.len())..];

    let recent_3y = tail(RECENT_3Y_DAYS);
    let s3 = if recent_3y.len() >= 100 { sortino(recent_3y) } else { overall };
    let recent_1y = tail(RECENT_1Y_DAYS);
    let s1 = if recent_1y.len() >= 50 { sortino(recent_1y) } else { overall };

    let parts: Vec<(f64, f64)> = [(overall, 0.3), (s3, 0.4), (s1, 0.3)]
        .into_iter()
        .filter_map(|(s, w)| s.filter(|v| v.is_finite()).map(|v| (v, w)))
        .collect();
    let total: f64 = parts.iter().map(|(_, w)| w).sum();
    if parts.is_empty() || total == 0.0 {
        return None;
    }
    Some(parts.iter().map(|(s, w)| s * w / total).sum())
}

/// Maximum drawdown of a value curve as a positive fraction.
pub fn max_drawdown(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut peak = f64::MIN;
    let mut mdd = 0.0;
    for v in values {
        if v > peak {
            peak = v;
        }
        if peak > 0.0 {
            let dd = 1.0 - v / peak;
            if dd > mdd {
                mdd = dd;
            }
        }
    }
    mdd
}

/// Return, CAGR and drawdown over the trailing `years` of a stored curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodPerformance {
    pub total_return: f64,
    pub cagr: f64,
    pub max_drawdown: f64,
}

pub fn period_performance(curve: &[EquityPoint], years: u32) -> Option<PeriodPerformance> {
    let last = curve.last()?;
    let start = last.date.checked_sub_months(Months::new(12 * years))?;
    if curve[0].date > start {
        // history is shorter than the period
        return None;
    }
    let window: Vec<&EquityPoint> = curve.iter().filter(|p| p.date >= start).collect();
    if window.len() < 2 {
        return None;
    }
    let first = window[0];
    if first.value <= 0.0 {
        return None;
    }
    let factor = last.value / first.value;
    Some(PeriodPerformance {
        total_return: factor - 1.0,
        cagr: cagr(factor, years_between(first.date, last.date)),
        max_drawdown: max_drawdown(window.iter().map(|p| p.value)),
    })
}
