use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use cinepoint_core::Stream;
use cinepoint_sync::{
    parse_stream_selector, report_daily_markdown, BackendKind, RunOptions, SyncConfig,
    SyncRunSummary, SyncService,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cinepoint-cli")]
#[command(about = "Cinepoint cinema data sync")]
struct Cli {
    /// Storage backend; overrides CINEPOINT_BACKEND.
    #[arg(long, global = true)]
    backend: Option<BackendKind>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Incremental run from stored watermarks.
    Sync {
        /// Stream key such as `movies` or `box_office:weekly`; repeatable.
        #[arg(long = "stream")]
        streams: Vec<String>,
        #[arg(long)]
        end_date: Option<NaiveDate>,
    },
    /// Re-fetch a fixed number of days ignoring watermarks.
    Backfill {
        #[arg(long, default_value_t = 7)]
        days: u32,
        /// Restrict to one stream; `boxoffice` selects every period.
        #[arg(long)]
        only: Option<String>,
        #[arg(long)]
        end_date: Option<NaiveDate>,
    },
    /// Run the cron schedule until interrupted.
    Schedule,
    /// Print a digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn selected_streams(selectors: &[String]) -> Result<Option<Vec<Stream>>> {
    if selectors.is_empty() {
        return Ok(None);
    }
    let mut streams = Vec::new();
    for selector in selectors {
        streams.extend(parse_stream_selector(selector)?);
    }
    Ok(Some(streams))
}

fn print_summary(summary: &SyncRunSummary, reports_dir: &std::path::Path) -> Result<()> {
    println!(
        "sync complete: run_id={} kind={} end_date={} backend={} written={} reports={}",
        summary.run_id,
        summary.kind.as_str(),
        summary.end_date,
        summary.backend,
        summary.total_written(),
        reports_dir.display()
    );
    for report in &summary.reports {
        println!(
            "  {:<20} {:<9} fetched={} written={} skipped={}",
            report.stream.key(),
            report.status.as_str(),
            report.fetched,
            report.written,
            report.skipped
        );
    }
    let failed = summary.failed().count();
    if failed > 0 {
        bail!("{failed} stream(s) did not complete");
    }
    Ok(())
}

async fn run(service: &SyncService, options: RunOptions) -> Result<()> {
    let token = service.orchestrator().cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling sync");
            token.cancel();
        }
    });
    let (summary, reports_dir) = service.run_once(&options).await?;
    print_summary(&summary, &reports_dir)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    match cli.command.unwrap_or(Commands::Sync {
        streams: Vec::new(),
        end_date: None,
    }) {
        Commands::Sync { streams, end_date } => {
            let mut options = RunOptions::daily();
            options.streams = selected_streams(&streams)?;
            options.end_date = end_date;
            let service = SyncService::from_config(config).await?;
            run(&service, options).await?;
        }
        Commands::Backfill {
            days,
            only,
            end_date,
        } => {
            let mut options = RunOptions::backfill(days);
            options.streams = selected_streams(only.as_slice())?;
            options.end_date = end_date;
            let service = SyncService::from_config(config).await?;
            run(&service, options).await?;
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let service = SyncService::from_config(config).await?;
            let Some(mut sched) = service.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %service.config().sync_cron_1,
                cron_2 = %service.config().sync_cron_2,
                "scheduler running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            service.orchestrator().cancellation_token().cancel();
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "scheduler shutdown failed");
            }
        }
        Commands::Report { runs } => {
            let markdown = report_daily_markdown(runs, &config.reports_dir)?;
            println!("{markdown}");
        }
    }

    Ok(())
}
