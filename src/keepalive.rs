use anyhow::{Context, Result, bail};
use std::env;
use std::time::Duration;
use tracing::{info, warn};

use crate::KeepaliveArgs;
use crate::fetch::{ApiPlan, mk_client};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// `--url`, else `APP_URL`; blank values count as unset.
pub fn resolve_url(args: &KeepaliveArgs) -> Option<String> {
    args.url
        .clone()
        .or_else(|| env::var("APP_URL").ok())
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
}

/// Sends one GET to the hosted dashboard. Without a URL this is a no-op.
pub async fn execute(args: &KeepaliveArgs) -> Result<()> {
    let Some(url) = resolve_url(args) else {
        warn!("APP_URL is not set, nothing to ping");
        return Ok(());
    };
    let url = reqwest::Url::parse(&url).with_context(|| format!("invalid APP_URL {url:?}"))?;
    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));

    let client = mk_client(&ApiPlan::Public)?;
    let resp = client
        .get(url.clone())
        .timeout(timeout)
        .send()
        .await
        .with_context(|| format!("ping {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        bail!("ping {url}: HTTP {status}");
    }
    info!("pinged {url}: {status}");
    Ok(())
}
