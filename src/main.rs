mod config;
mod loader;
mod models;
mod pipeline;
mod portal;
mod report;
mod storage;
mod transform;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::pipeline::{IngestionPipeline, ingest_day};
use crate::portal::{ChartFetcher, PortalSession};
use crate::report::StoreStats;
use crate::storage::Repository;

#[derive(Parser)]
#[command(
    name = "radiant-net",
    about = "Solar portal scraper: fetch daily inverter charts and load them into DuckDB",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and save the production and consumption charts of one day
    Scrape {
        /// Directory for the JSON files (default: paths.raw_data_dir)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Which day to fetch, counted back from today
        #[arg(short, long, default_value_t = 1)]
        days_ago: u32,
    },

    /// Load saved chart files into the database
    Parse {
        /// Directory scanned for *.json chart files (default: paths.raw_data_dir)
        #[arg(short, long, conflicts_with = "input_files")]
        input_dir: Option<PathBuf>,

        /// Explicit chart files instead of a directory
        #[arg(short = 'f', long, num_args = 1..)]
        input_files: Vec<PathBuf>,

        /// Database file (default: storage.db_path)
        #[arg(short, long)]
        output_db: Option<PathBuf>,
    },

    /// Scrape one day and load it right away
    Ingest {
        /// Default: schedule.days_ago
        #[arg(short, long)]
        days_ago: Option<u32>,
    },

    /// Run `ingest` periodically until interrupted
    Schedule {
        /// Default: schedule.interval_hours
        #[arg(long)]
        interval_hours: Option<u64>,

        /// Default: schedule.days_ago
        #[arg(short, long)]
        days_ago: Option<u32>,
    },

    /// Show database statistics
    Stats,

    /// Print the configuration and data locations as JSON
    Paths,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "radiant_net=info,warn",
        1 => "radiant_net=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Scrape {
            output_dir,
            days_ago,
        } => {
            let started = Instant::now();
            let output_dir = output_dir.unwrap_or_else(|| config.paths.raw_data_dir.clone());
            let tz = config.series_transform()?.timezone();

            let session = PortalSession::connect(&config.portal, config.credentials()?)
                .await
                .context("Login to the portal failed")?;
            let files = ChartFetcher::new(&session, tz)
                .run(&output_dir, days_ago)
                .await?;

            for (chart_type, path) in &files {
                println!("{:<12} {}", chart_type.as_str(), path.display());
            }
            info!("Scrape finished in {:.2?}", started.elapsed());
        }

        Command::Parse {
            input_dir,
            input_files,
            output_db,
        } => {
            let pipeline = IngestionPipeline::new(config.series_transform()?);

            let files = if input_files.is_empty() {
                let dir = input_dir.unwrap_or_else(|| config.paths.raw_data_dir.clone());
                pipeline.discover_groups(&dir)?
            } else {
                loader::group_chart_files(&input_files)
            };
            info!(
                "{} chart groups to ingest, {} unpaired files",
                files.groups.len(),
                files.unpaired.len()
            );

            let db_path = output_db.unwrap_or_else(|| config.storage.db_path.clone());
            let repo = Repository::open(&db_path)
                .with_context(|| format!("Failed to open {:?}", db_path))?;
            let report = pipeline.ingest_files(&files, &repo)?;
            println!("{}", report);
        }

        Command::Ingest { days_ago } => {
            let days_ago = days_ago.unwrap_or(config.schedule.days_ago);
            let report = ingest_day(&config, days_ago).await?;
            println!("{}", report);
        }

        Command::Schedule {
            interval_hours,
            days_ago,
        } => {
            let hours = interval_hours.unwrap_or(config.schedule.interval_hours);
            let days_ago = days_ago.unwrap_or(config.schedule.days_ago);
            if hours == 0 {
                bail!("interval_hours must be at least 1");
            }

            info!("Ingesting every {}h (day = today - {}), Ctrl-C to stop", hours, days_ago);
            let mut ticker = tokio::time::interval(Duration::from_secs(hours * 3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, stopping the schedule");
                        break;
                    }
                }

                let started = Instant::now();
                match ingest_day(&config, days_ago).await {
                    Ok(report) if report.is_complete() => info!(
                        "Scheduled ingest done: {} raw rows added",
                        report.raw.inserted
                    ),
                    Ok(report) => warn!(
                        "Scheduled ingest finished with {} failed groups",
                        report.failed.len()
                    ),
                    Err(e) => error!(
                        "Scheduled ingest failed after {:.1?}: {:#}",
                        started.elapsed(),
                        e
                    ),
                }
            }
        }

        Command::Stats => {
            let repo = Repository::open(&config.storage.db_path)?;
            println!("{}", StoreStats::collect(&repo, &config.storage.db_path)?);
        }

        Command::Paths => {
            println!("{}", serde_json::to_string_pretty(&config.paths())?);
        }
    }

    Ok(())
}
