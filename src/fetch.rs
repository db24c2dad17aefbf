use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, TimeZone, Utc};
use itertools::Itertools;
use reqwest::{Client, header};
use serde::Deserialize;
use std::cell::Cell;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::FetchArgs;
use crate::config::PipelineConfig;
use crate::series::{self, AlignedPrices, Asset, PriceSeries};

const PRO_BASE: &str = "https://pro-api.coingecko.com/api/v3";
const PUBLIC_BASE: &str = "https://api.coingecko.com/api/v3";
const ONE_DAY: i64 = 86_400;
const MAX_CHUNK_DAYS: i64 = 365;
const PUBLIC_HISTORY_DAYS: i64 = 364;
const PRICES_FILE: &str = "prices.csv";

/// Where daily closes come from.
#[allow(async_fn_in_trait)]
pub trait PriceSource {
    fn name(&self) -> String;

    /// Daily closes for `[start, end]`. An unreachable provider or an empty
    /// answer is an error.
    async fn fetch(&self, asset: Asset, start: NaiveDate, end: NaiveDate) -> Result<PriceSeries>;
}

/// `market_chart/range` response; only the price samples are used.
#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(f64, f64)>,
}

/// CoinGecko access tier, picked from the configured keys (Pro wins over Demo).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiPlan {
    Pro(String),
    Demo(String),
    Public,
}

impl ApiPlan {
    pub fn from_keys(pro: Option<&str>, demo: Option<&str>) -> Self {
        match (pro, demo) {
            (Some(key), _) => ApiPlan::Pro(key.to_string()),
            (None, Some(key)) => ApiPlan::Demo(key.to_string()),
            (None, None) => ApiPlan::Public,
        }
    }

    fn base(&self) -> &'static str {
        match self {
            ApiPlan::Pro(_) => PRO_BASE,
            ApiPlan::Demo(_) | ApiPlan::Public => PUBLIC_BASE,
        }
    }

    /// Demo and keyless callers only get the last year of history.
    pub fn history_limited(&self) -> bool {
        !matches!(self, ApiPlan::Pro(_))
    }
}

/// First date that can be requested. On a limited plan a start older than
/// the provider's history window is moved forward.
pub fn history_start(
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
    limited: bool,
) -> Result<NaiveDate> {
    if !limited {
        return Ok(start);
    }
    let earliest = today - chrono::Duration::days(PUBLIC_HISTORY_DAYS);
    if end < earliest {
        bail!(
            "{start}..{end} is older than the last {PUBLIC_HISTORY_DAYS} days the public \
             CoinGecko API serves; set CG_PRO_API_KEY for full history"
        );
    }
    if start < earliest {
        warn!(
            "no CoinGecko Pro key: history limited to the last {PUBLIC_HISTORY_DAYS} days, \
             start moved from {start} to {earliest} (set CG_PRO_API_KEY for full history)"
        );
        return Ok(earliest);
    }
    Ok(start)
}

pub struct CoinGecko {
    client: Client,
    plan: ApiPlan,
    vs: String,
    request_delay: Duration,
    sent: Cell<bool>,
}

impl CoinGecko {
    pub fn new(plan: ApiPlan, vs: &str, request_delay_ms: u64) -> Result<Self> {
        Ok(Self {
            client: mk_client(&plan)?,
            plan,
            vs: vs.to_string(),
            request_delay: Duration::from_millis(request_delay_ms),
            sent: Cell::new(false),
        })
    }

    /// Build URL for one chunk of the range endpoint
    fn range_url(&self, coin_id: &str, from_ts: i64, to_ts: i64) -> Result<reqwest::Url> {
        let base = format!("{}/coins/{}/market_chart/range", self.plan.base(), coin_id);
        Ok(reqwest::Url::parse_with_params(
            &base,
            &[
                ("vs_currency", self.vs.clone()),
                ("from", from_ts.to_string()),
                ("to", to_ts.to_string()),
            ],
        )?)
    }

    /// Waits `request_delay` before every request but the first.
    async fn pace(&self) {
        if self.sent.replace(true) && !self.request_delay.is_zero() {
            sleep(self.request_delay).await;
        }
    }
}

impl PriceSource for CoinGecko {
    fn name(&self) -> String {
        format!("CoinGecko ({})", self.plan.base())
    }

    async fn fetch(&self, asset: Asset, start: NaiveDate, end: NaiveDate) -> Result<PriceSeries> {
        let start = history_start(
            start,
            end,
            Utc::now().date_naive(),
            self.plan.history_limited(),
        )?;
        let (from_ts, to_ts) = day_bounds(start, end)?;
        let mut samples: Vec<(f64, f64)> = vec![];
        let mut cur_from = from_ts;
        while cur_from < to_ts {
            let cur_to = (cur_from + MAX_CHUNK_DAYS * ONE_DAY).min(to_ts);
            let url = self.range_url(asset.coin_id(), cur_from, cur_to)?;
            self.pace().await;
            let chart: MarketChart = get_json(&self.client, url)
                .await
                .with_context(|| format!("fetch {asset} {cur_from}..{cur_to}"))?;
            samples.extend(chart.prices);
            cur_from = cur_to + 1;
        }

        let series = PriceSeries::from_points(asset, daily_closes(samples));
        if series.is_empty() {
            bail!("{asset}: provider returned an empty series for {start}..{end}");
        }
        info!(
            "{}: {} daily closes ({} .. {})",
            asset,
            series.len(),
            series.dates[0],
            series.dates[series.len() - 1]
        );
        Ok(series)
    }
}

/// Offline source: a `date,btc,eth` CSV such as the one `fetch` exports.
pub struct CsvFile {
    pub path: PathBuf,
}

impl PriceSource for CsvFile {
    fn name(&self) -> String {
        format!("CSV {}", self.path.display())
    }

    async fn fetch(&self, asset: Asset, start: NaiveDate, end: NaiveDate) -> Result<PriceSeries> {
        let all = series::read_prices_csv(&self.path)?;
        let s = all.series(asset);
        let series = PriceSeries::from_points(
            asset,
            s.dates
                .iter()
                .copied()
                .zip(s.close.iter().copied())
                .filter(|(d, _)| *d >= start && *d <= end),
        );
        if series.is_empty() {
            bail!("{asset}: {} has no rows in {start}..{end}", self.path.display());
        }
        Ok(series)
    }
}

/// Fetches BTC then ETH and aligns them on common dates.
pub async fn fetch_aligned<S: PriceSource>(
    source: &S,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<AlignedPrices> {
    info!("fetching BTC/ETH from {} ({start} .. {end})", source.name());
    let btc = source.fetch(Asset::Btc, start, end).await?;
    let eth = source.fetch(Asset::Eth, start, end).await?;
    let aligned = series::align(&btc, &eth)?;
    info!(
        "aligned {} common days (BTC {}, ETH {})",
        aligned.dates().len(),
        btc.len(),
        eth.len()
    );
    Ok(aligned)
}

/// Picks the provider named by the configuration.
pub enum Source {
    CoinGecko(CoinGecko),
    Csv(CsvFile),
}

impl Source {
    pub fn from_config(cfg: &PipelineConfig) -> Result<Self> {
        Ok(match &cfg.prices_csv {
            Some(path) => Source::Csv(CsvFile { path: path.clone() }),
            None => Source::CoinGecko(CoinGecko::new(
                ApiPlan::from_keys(cfg.api_key.as_deref(), cfg.demo_api_key.as_deref()),
                &cfg.vs,
                cfg.request_delay_ms,
            )?),
        })
    }
}

impl PriceSource for Source {
    fn name(&self) -> String {
        match self {
            Source::CoinGecko(s) => s.name(),
            Source::Csv(s) => s.name(),
        }
    }

    async fn fetch(&self, asset: Asset, start: NaiveDate, end: NaiveDate) -> Result<PriceSeries> {
        match self {
            Source::CoinGecko(s) => s.fetch(asset, start, end).await,
            Source::Csv(s) => s.fetch(asset, start, end).await,
        }
    }
}

/// Exports the aligned closes of the configured range to CSV.
pub async fn execute(args: &FetchArgs) -> Result<()> {
    let cfg = args.pipeline.resolve()?;
    let out = args
        .out
        .clone()
        .unwrap_or_else(|| cfg.results.with_file_name(PRICES_FILE));
    let source = Source::from_config(&cfg)?;
    let prices = fetch_aligned(&source, cfg.start, cfg.end).await?;
    series::write_prices_csv(&out, &prices)?;
    println!("✅ {} days of BTC/ETH closes -> {}", prices.dates().len(), out.display());
    Ok(())
}

/// Make an HTTP client, with the plan's key header when one is configured
pub fn mk_client(plan: &ApiPlan) -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    match plan {
        ApiPlan::Pro(key) => {
            headers.insert("x-cg-pro-api-key", header::HeaderValue::from_str(key)?);
        }
        ApiPlan::Demo(key) => {
            headers.insert("x-cg-demo-api-key", header::HeaderValue::from_str(key)?);
        }
        ApiPlan::Public => {}
    }
    let client = Client::builder()
        .default_headers(headers)
        .user_agent(concat!("crypto-ma-dashboard/", env!("CARGO_PKG_VERSION"), " (rust)"))
        .timeout(Duration::from_secs(30))
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()?;
    Ok(client)
}

/// Single GET; any non-success status fails the run (the next scheduled run retries).
pub async fn get_json<T: for<'de> serde::Deserialize<'de>>(
    client: &Client,
    url: reqwest::Url,
) -> Result<T> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let txt = resp.text().await.unwrap_or_default();
        bail!("HTTP {}; body: {}", status, txt.chars().take(300).collect::<String>());
    }
    Ok(resp.json::<T>().await?)
}

/// Unix seconds of `start 00:00:00` and `end 23:59:59` (UTC).
fn day_bounds(start: NaiveDate, end: NaiveDate) -> Result<(i64, i64)> {
    let from = start.and_hms_opt(0, 0, 0).context("start time")?;
    let to = end.and_hms_opt(23, 59, 59).context("end time")?;
    let (from, to) = (
        Utc.from_utc_datetime(&from).timestamp(),
        Utc.from_utc_datetime(&to).timestamp(),
    );
    if to <= from {
        bail!("end must be after start");
    }
    Ok((from, to))
}

/// Reduces `(timestamp_ms, price)` samples to one close per UTC date: the last sample of each day.
pub fn daily_closes(mut samples: Vec<(f64, f64)>) -> Vec<(NaiveDate, f64)> {
    samples.retain(|(ts, _)| ts.is_finite());
    samples.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut out = vec![];
    for (date, group) in &samples.into_iter().chunk_by(|(ts, _)| {
        Utc.timestamp_millis_opt(*ts as i64)
            .single()
            .map(|t| t.date_naive())
    }) {
        if let (Some(date), Some(last)) = (date, group.last()) {
            out.push((date, last.1));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(date: &str, hour: u32) -> f64 {
        let d: NaiveDate = date.parse().unwrap();
        Utc.from_utc_datetime(&d.and_hms_opt(hour, 0, 0).unwrap())
            .timestamp_millis() as f64
    }

    #[test]
    fn daily_closes_keep_last_sample_per_day() {
        let samples = vec![
            (ms("2024-03-02", 0), 20.0),
            (ms("2024-03-01", 0), 10.0),
            (ms("2024-03-01", 23), 11.0),
            (ms("2024-03-02", 12), 21.0),
        ];
        let out = daily_closes(samples);
        assert_eq!(
            out,
            vec![
                ("2024-03-01".parse().unwrap(), 11.0),
                ("2024-03-02".parse().unwrap(), 21.0)
            ]
        );
    }

    #[test]
    fn market_chart_payload_parses() {
        let raw = r#"{"prices":[[1704067200000,42280.23],[1704153600000,44187.14]],
                      "market_caps":[[1704067200000,1.0]],"total_volumes":[[1704067200000,2.0]]}"#;
        let chart: MarketChart = serde_json::from_str(raw).unwrap();
        let out = daily_closes(chart.prices);
        assert_eq!(out[0].0, "2024-01-01".parse::<NaiveDate>().unwrap());
        assert_eq!(out[1].1, 44187.14);
    }

    #[test]
    fn range_url_has_unix_bounds() {
        let cg = CoinGecko::new(ApiPlan::Public, "usd", 0).unwrap();
        let url = cg.range_url("bitcoin", 100, 200).unwrap();
        assert!(url.as_str().starts_with(PUBLIC_BASE));
        let pro = CoinGecko::new(ApiPlan::Pro("k".into()), "usd", 0).unwrap();
        assert!(pro.range_url("bitcoin", 100, 200).unwrap().as_str().starts_with(PRO_BASE));
        assert!(url.as_str().contains("/coins/bitcoin/market_chart/range"));
        assert!(url.as_str().contains("from=100&to=200"));
    }

    #[test]
    fn day_bounds_cover_whole_days() {
        let d = |s: &str| s.parse::<NaiveDate>().unwrap();
        let (from, to) = day_bounds(d("2024-01-01"), d("2024-01-02")).unwrap();
        assert_eq!(to - from, 2 * ONE_DAY - 1);
        assert!(day_bounds(d("2024-01-02"), d("2024-01-01")).is_err());
    }

    #[test]
    fn limited_plans_start_within_last_year() {
        let d = |s: &str| s.parse::<NaiveDate>().unwrap();
        let today = d("2025-06-30");
        let earliest = today - chrono::Duration::days(PUBLIC_HISTORY_DAYS);

        let clamped = history_start(d("2016-01-01"), today, today, true).unwrap();
        assert_eq!(clamped, earliest);
        assert_eq!(history_start(d("2025-03-01"), today, today, true).unwrap(), d("2025-03-01"));
        assert_eq!(history_start(d("2016-01-01"), today, today, false).unwrap(), d("2016-01-01"));
        assert!(history_start(d("2016-01-01"), d("2020-01-01"), today, true).is_err());
    }

    #[test]
    fn pro_key_wins_over_demo_key() {
        assert_eq!(ApiPlan::from_keys(Some("p"), Some("d")), ApiPlan::Pro("p".into()));
        assert_eq!(ApiPlan::from_keys(None, Some("d")), ApiPlan::Demo("d".into()));
        assert!(ApiPlan::from_keys(None, Some("d")).history_limited());
        assert!(ApiPlan::Public.history_limited());
        assert!(!ApiPlan::Pro("p".into()).history_limited());
    }

    #[tokio::test]
    async fn requests_after_the_first_are_paced() {
        let cg = CoinGecko::new(ApiPlan::Public, "usd", 50).unwrap();
        let t0 = std::time::Instant::now();
        cg.pace().await;
        assert!(t0.elapsed() < Duration::from_millis(50));
        cg.pace().await;
        assert!(t0.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn csv_source_filters_by_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.csv");
        std::fs::write(
            &path,
            "date,btc,eth\n2024-01-01,1,10\n2024-01-02,2,20\n2024-01-03,3,30\n",
        )
        .unwrap();
        let src = CsvFile { path };
        let d = |s: &str| s.parse::<NaiveDate>().unwrap();
        let eth = src.fetch(Asset::Eth, d("2024-01-02"), d("2024-01-03")).await.unwrap();
        assert_eq!(eth.close, vec![20.0, 30.0]);
        assert!(src.fetch(Asset::Btc, d("2025-01-01"), d("2025-02-01")).await.is_err());
    }
}
