mod config;
mod error;
mod filter;
mod loader;
mod merge;
mod models;
mod pipeline;
mod report;
mod scraper;
mod storage;
mod trend;
mod utils;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{AppConfig, FilterConfig};
use crate::filter::{TypeFilter, filter};
use crate::pipeline::Pipeline;
use crate::report::{OutputFormat, render_listings, render_series, render_trend};
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "sssb-tracker", about = "SSSB housing queue tracker", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

/// Overrides for the `[filter]` config section.
#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Housing type
    #[arg(long = "type", value_enum)]
    housing_type: Option<TypeFilter>,

    /// Highest monthly rent (listings with unknown rent are kept)
    #[arg(long)]
    max_rent: Option<u32>,

    /// Case-insensitive part of the area name
    #[arg(long)]
    area: Option<String>,
}

impl FilterArgs {
    fn apply(self, cfg: &mut FilterConfig) {
        if let Some(t) = self.housing_type {
            cfg.housing_type = t;
        }
        if self.max_rent.is_some() {
            cfg.max_rent = self.max_rent;
        }
        if self.area.is_some() {
            cfg.area = self.area;
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Log in, crawl the portal and store today's snapshot
    Scrape {
        #[command(flatten)]
        filters: FilterArgs,

        /// Skip detail pages (no closing dates, faster)
        #[arg(long)]
        no_closing_dates: bool,

        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },

    /// Print the latest stored snapshot
    Show {
        #[command(flatten)]
        filters: FilterArgs,

        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },

    /// Best-bid statistics per day over the trailing window
    Trend {
        /// Window in days, ending at the latest snapshot
        #[arg(short, long)]
        window: Option<u32>,

        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,

        /// One series per listing instead of daily statistics
        #[arg(long)]
        per_listing: bool,
    },

    /// Write the stored history to a CSV file
    ExportHistory { file: PathBuf },

    /// Load snapshots from a history CSV file
    ImportHistory { file: PathBuf },

    /// Show database statistics
    Stats,

    /// Apply schema migrations without scraping
    Migrate,
}

fn open_repo(config: &AppConfig) -> Result<Repository> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(repo)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter_spec = match cli.verbose {
        0 => "sssb_tracker=info,warn",
        1 => "sssb_tracker=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter_spec))
        .init();

    let mut config = AppConfig::load()?;

    match cli.command {
        Command::Scrape {
            filters,
            no_closing_dates,
            output,
        } => {
            let _t = utils::Timer::start("Scrape");
            filters.apply(&mut config.filter);
            if no_closing_dates {
                config.fetch.fetch_closing_dates = false;
            }

            let repo = open_repo(&config)?;
            let pipeline = Pipeline::new(config.clone())?;
            let report = pipeline.run(&repo).await?;

            let latest = report
                .history
                .latest()
                .context("run produced no snapshot")?;
            let shown = filter(latest.records(), &config.filter_set());
            print!("{}", render_listings(&shown, latest.taken_at(), output)?);

            if report.stats.details_skipped > 0 {
                warn!(
                    "{} detail fetch(es) skipped; their closing dates may be missing or carried over",
                    report.stats.details_skipped
                );
            }
        }

        Command::Show { filters, output } => {
            filters.apply(&mut config.filter);
            let repo = open_repo(&config)?;
            let (_, newest) = repo.date_range()?;
            let history = repo.load_history(newest)?;
            match history.latest() {
                Some(latest) => {
                    let shown = filter(latest.records(), &config.filter_set());
                    print!("{}", render_listings(&shown, latest.taken_at(), output)?);
                }
                None => println!("No snapshots yet, run `sssb-tracker scrape` first."),
            }
        }

        Command::Trend {
            window,
            output,
            per_listing,
        } => {
            let window = window.unwrap_or(config.trend.window_days);
            let repo = open_repo(&config)?;
            let history = repo.load_history(None)?;
            let rendered = if per_listing {
                render_series(&trend::listing_series(&history, window), output)?
            } else {
                render_trend(&trend::aggregate(&history, window), output)?
            };
            print!("{}", rendered);
        }

        Command::ExportHistory { file } => {
            let repo = open_repo(&config)?;
            let history = repo.load_history(None)?;
            loader::export_history(&history, &file)?;
        }

        Command::ImportHistory { file } => {
            let _t = utils::Timer::start("History import");
            let repo = open_repo(&config)?;
            let snapshots = loader::load_history_csv(&file)?;
            let mut rows = 0usize;
            for snapshot in &snapshots {
                rows += repo
                    .save_snapshot(snapshot)
                    .with_context(|| format!("Failed to store snapshot {}", snapshot.date()))?;
            }
            info!("Done: {} snapshots, {} listing rows imported", snapshots.len(), rows);
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let snapshots = repo.snapshot_count()?;
            let rows = repo.listing_row_count()?;
            let units = repo.unit_count()?;
            let (min, max) = repo.date_range().unwrap_or((None, None));
            let last_run = repo.recent_runs(1)?.into_iter().next();
            println!("─────────────────────────────────");
            println!("  SSSB tracker — Database Stats");
            println!("─────────────────────────────────");
            println!("  Snapshots    : {}", utils::fmt_count(snapshots));
            println!("  Listing rows : {}", utils::fmt_count(rows));
            println!("  Units seen   : {}", utils::fmt_count(units));
            println!("  From         : {}", min.map(|d| d.to_string()).unwrap_or("—".into()));
            println!("  To           : {}", max.map(|d| d.to_string()).unwrap_or("—".into()));
            if let Some(run) = last_run {
                println!(
                    "  Last run     : {} ({}, {} listings, {} details skipped)",
                    run.started_at.format("%Y-%m-%d %H:%M"),
                    run.status,
                    run.listings_seen,
                    run.details_skipped
                );
                if let Some(msg) = run.error_msg {
                    println!("  Last error   : {}", msg);
                }
            }
            println!("─────────────────────────────────");
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
