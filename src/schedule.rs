use anyhow::{Context, Result, bail};
use chrono::{NaiveTime, Timelike};
use clap::ValueEnum;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::ScheduleArgs;

const BIN: &str = "crypto-ma-dashboard";
const DEFAULT_AT: &str = "09:00";
const DEFAULT_WORKDIR: &str = "/opt/crypto-ma-dashboard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ScheduleFormat {
    /// crontab line for /etc/cron.d
    #[default]
    Cron,
    /// GitHub Actions workflow that runs the pipeline and commits the result file
    Github,
    /// systemd service + timer pair
    Systemd,
}

/// Parse `HH:MM` (24h).
pub fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    let parts: Vec<_> = s.split(':').collect();
    if parts.len() != 2 {
        bail!("bad time format");
    }
    let h: u32 = parts[0].trim().parse()?;
    let m: u32 = parts[1].trim().parse()?;
    NaiveTime::from_hms_opt(h, m, 0).context("invalid hh:mm")
}

/// Daily cron entry that runs the pipeline from `workdir`.
pub fn cron_entry(at: NaiveTime, workdir: &Path) -> String {
    let dir = workdir.display();
    format!(
        "# BTC/ETH MA strategies - daily at {:02}:{:02}
{} {} * * * root cd {dir} && {dir}/{BIN} run >> {dir}/logs/cron.out 2>&1
",
        at.hour(),
        at.minute(),
        at.minute(),
        at.hour(),
    )
}

/// Workflow that refreshes the result file once a day (UTC) and pings the
/// hosted dashboard afterwards.
pub fn github_workflow(at: NaiveTime) -> String {
    format!(
        r#"name: Daily strategy update

on:
  schedule:
    - cron: "{min} {hour} * * *"
  workflow_dispatch:

permissions:
  contents: write

jobs:
  update:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - uses: dtolnay/rust-toolchain@stable
      - uses: Swatinem/rust-cache@v2
      - name: Run pipeline
        env:
          CG_PRO_API_KEY: ${{{{ secrets.CG_PRO_API_KEY }}}}
          CG_DEMO_API_KEY: ${{{{ secrets.CG_DEMO_API_KEY }}}}
        run: cargo run --release -- run
      - name: Commit results
        run: |
          git config user.name "github-actions[bot]"
          git config user.email "github-actions[bot]@users.noreply.github.com"
          git add data/strategy_results.json
          git diff --cached --quiet || git commit -m "Update strategy results"
          git push
      - name: Keep dashboard awake
        env:
          APP_URL: ${{{{ secrets.APP_URL }}}}
        run: cargo run --release -- keepalive
"#,
        min = at.minute(),
        hour = at.hour(),
    )
}

/// systemd oneshot service and its daily timer.
pub fn systemd_units(at: NaiveTime, workdir: &Path) -> (String, String) {
    let dir = workdir.display();
    let service = format!(
        "[Unit]
Description=BTC/ETH MA strategy pipeline
After=network-online.target
Wants=network-online.target

[Service]
Type=oneshot
WorkingDirectory={dir}
ExecStart={dir}/{BIN} run
Environment=RUST_LOG=info
EnvironmentFile=-{dir}/.env
"
    );
    let timer = format!(
        "[Unit]
Description=Daily BTC/ETH MA strategy pipeline

[Timer]
OnCalendar=*-*-* {:02}:{:02}:00
Persistent=true

[Install]
WantedBy=timers.target
",
        at.hour(),
        at.minute()
    );
    (service, timer)
}

fn write(path: PathBuf, content: &str) -> Result<PathBuf> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
    info!("generated {}", path.display());
    Ok(path)
}

/// Writes the requested scheduling files and prints how to install them.
pub fn execute(args: &ScheduleArgs) -> Result<Vec<PathBuf>> {
    let at = parse_hhmm(args.at.as_deref().unwrap_or(DEFAULT_AT))
        .context("invalid --at (expected HH:MM)")?;
    let workdir = args
        .workdir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR));
    let out = args.out.clone().unwrap_or_else(|| PathBuf::from("."));

    let written = match args.format.unwrap_or_default() {
        ScheduleFormat::Cron => {
            let path = write(out.join(format!("{BIN}.cron")), &cron_entry(at, &workdir))?;
            println!("📄 Cron job generated: {}", path.display());
            println!("To install:");
            println!("  sudo cp {} /etc/cron.d/{BIN}", path.display());
            println!("  sudo chmod 644 /etc/cron.d/{BIN}");
            vec![path]
        }
        ScheduleFormat::Github => {
            let path = write(
                out.join(".github").join("workflows").join("daily.yml"),
                &github_workflow(at),
            )?;
            println!("📄 Workflow generated: {}", path.display());
            println!("Add APP_URL and one CoinGecko key as repository secrets:");
            println!("  CG_PRO_API_KEY   full history from the configured start date");
            println!("  CG_DEMO_API_KEY  last 365 days only (also the limit with no key)");
            vec![path]
        }
        ScheduleFormat::Systemd => {
            let (service, timer) = systemd_units(at, &workdir);
            let s = write(out.join(format!("{BIN}.service")), &service)?;
            let t = write(out.join(format!("{BIN}.timer")), &timer)?;
            println!("📄 systemd units generated: {} {}", s.display(), t.display());
            println!("To install:");
            println!("  sudo cp {} {} /etc/systemd/system/", s.display(), t.display());
            println!("  sudo systemctl daemon-reload");
            println!("  sudo systemctl enable --now {BIN}.timer");
            vec![s, t]
        }
    };
    Ok(written)
}
