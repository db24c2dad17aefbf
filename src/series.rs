use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, fs, path::Path};
use tempfile::NamedTempFile;

/// The two assets the pipeline trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
}

impl Asset {
    pub const ALL: [Asset; 2] = [Asset::Btc, Asset::Eth];

    pub fn symbol(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
        }
    }

    /// CoinGecko coin id
    pub fn coin_id(&self) -> &'static str {
        match self {
            Asset::Btc => "bitcoin",
            Asset::Eth => "ethereum",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Daily closes of one asset, dates strictly increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    pub asset: Asset,
    pub dates: Vec<NaiveDate>,
    pub close: Vec<f64>,
}

impl PriceSeries {
    /// Builds a series from unordered `(date, close)` points.
    /// Later points win on duplicate dates; non-finite or non-positive closes are dropped.
    pub fn from_points(asset: Asset, points: impl IntoIterator<Item = (NaiveDate, f64)>) -> Self {
        let by_date: BTreeMap<NaiveDate, f64> = points
            .into_iter()
            .filter(|(_, c)| c.is_finite() && *c > 0.0)
            .collect();
        let (dates, close) = by_date.into_iter().unzip();
        Self {
            asset,
            dates,
            close,
        }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// BTC and ETH closes restricted to the dates both series share.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedPrices {
    pub btc: PriceSeries,
    pub eth: PriceSeries,
}

impl AlignedPrices {
    pub fn dates(&self) -> &[NaiveDate] {
        &self.btc.dates
    }

    pub fn series(&self, asset: Asset) -> &PriceSeries {
        match asset {
            Asset::Btc => &self.btc,
            Asset::Eth => &self.eth,
        }
    }
}

/// Dates present in every series, ascending.
pub fn intersect_dates(series: &[&PriceSeries]) -> Vec<NaiveDate> {
    use std::collections::BTreeSet;
    let mut iter = series
        .iter()
        .map(|s| s.dates.iter().cloned().collect::<BTreeSet<_>>());
    let Some(mut base) = iter.next() else {
        return vec![];
    };
    for s in iter {
        base = base.intersection(&s).cloned().collect();
    }
    base.into_iter().collect()
}

/// Drops every date not present in both series.
pub fn align(btc: &PriceSeries, eth: &PriceSeries) -> Result<AlignedPrices> {
    let dates = intersect_dates(&[btc, eth]);
    if dates.is_empty() {
        bail!("BTC and ETH series have no dates in common");
    }
    let restrict = |s: &PriceSeries| {
        let idx: BTreeMap<NaiveDate, f64> =
            s.dates.iter().copied().zip(s.close.iter().copied()).collect();
        PriceSeries {
            asset: s.asset,
            dates: dates.clone(),
            close: dates.iter().map(|d| idx[d]).collect(),
        }
    };
    Ok(AlignedPrices {
        btc: restrict(btc),
        eth: restrict(eth),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct PriceRow {
    date: NaiveDate,
    btc: f64,
    eth: f64,
}

/// Reads a `date,btc,eth` CSV.
pub fn read_prices_csv(path: &Path) -> Result<AlignedPrices> {
    let mut rdr = ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut btc = Vec::new();
    let mut eth = Vec::new();
    for rec in rdr.deserialize::<PriceRow>() {
        let r = rec.with_context(|| format!("parse {}", path.display()))?;
        btc.push((r.date, r.btc));
        eth.push((r.date, r.eth));
    }
    align(
        &PriceSeries::from_points(Asset::Btc, btc),
        &PriceSeries::from_points(Asset::Eth, eth),
    )
}

/// Writes aligned prices as `date,btc,eth` to a temp file, then renames it over `path`.
pub fn write_prices_csv(path: &Path, prices: &AlignedPrices) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(dir).context("create output dir")?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut wtr = WriterBuilder::new().from_writer(tmp.as_file_mut());
        wtr.write_record(["date", "btc", "eth"])?;
        for ((d, b), e) in prices
            .btc
            .dates
            .iter()
            .zip(&prices.btc.close)
            .zip(&prices.eth.close)
        {
            wtr.write_record(&[d.format("%Y-%m-%d").to_string(), format!("{b:.8}"), format!("{e:.8}")])?;
        }
        wtr.flush()?;
    }
    tmp.persist(path)?;
    Ok(())
}
