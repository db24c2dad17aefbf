use anyhow::Result;
use clap::{Parser, Subcommand};
use crypto_ma_dashboard::{
    DashboardArgs, FetchArgs, KeepaliveArgs, PipelineArgs, ScheduleArgs, dashboard, fetch,
    keepalive, logging, pipeline, schedule,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch prices, optimize windows, combine portfolios and write the result file
    Run(PipelineArgs),
    Dashboard(DashboardArgs),
    Fetch(FetchArgs),
    Schedule(ScheduleArgs),
    Keepalive(KeepaliveArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::setup_logging()?;

    let args = Args::parse();
    match args.command {
        Some(Command::Run(run_args)) => pipeline::execute(&run_args).await?,
        Some(Command::Dashboard(dash_args)) => dashboard::execute(&dash_args).await?,
        Some(Command::Fetch(fetch_args)) => fetch::execute(&fetch_args).await?,
        Some(Command::Schedule(schedule_args)) => {
            schedule::execute(&schedule_args)?;
        }
        Some(Command::Keepalive(ping_args)) => keepalive::execute(&ping_args).await?,
        None => {
            // Default behavior: one pipeline run with default arguments
            pipeline::execute(&PipelineArgs::default()).await?;
        }
    }
    Ok(())
}
