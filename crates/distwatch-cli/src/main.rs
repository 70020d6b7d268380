use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use distwatch_core::DigestPeriod;
use distwatch_sync::{DistrictWatch, WatchConfig};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "distwatch")]
#[command(about = "District code dataset refresh and jurisdiction monitoring")]
struct Cli {
    /// YAML configuration. DISTWATCH_* environment variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Score a local file without storing anything.
    Validate { file: PathBuf },
    /// Publish a dataset from a manually downloaded file.
    Import { file: PathBuf },
    /// Check the portal and refresh the dataset when it changed.
    Update {
        #[arg(long)]
        force: bool,
    },
    /// Print the latest stored dataset counts.
    Latest,
    /// Check one jurisdiction now, ignoring its schedule.
    Check { jurisdiction: String },
    Sweep,
    Summary,
    Digest { period: Period },
    /// Run one scheduled job immediately.
    Trigger { job: String },
    /// Run the scheduler until interrupted.
    Run,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Period {
    Daily,
    Weekly,
}

impl From<Period> for DigestPeriod {
    fn from(period: Period) -> Self {
        match period {
            Period::Daily => DigestPeriod::Daily,
            Period::Weekly => DigestPeriod::Weekly,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => WatchConfig::load(path)?,
        None => WatchConfig::from_env(),
    };
    let watch = Arc::new(DistrictWatch::new(config)?);

    match cli.command.unwrap_or(Commands::Update { force: false }) {
        Commands::Validate { file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let report = watch.validate_bytes(&bytes);
            print_json(&report)?;
            if !report.is_valid {
                bail!("{} failed validation", file.display());
            }
        }
        Commands::Import { file } => {
            let report = watch.import_dataset_file(&file).await?;
            print_json(&report)?;
            if !report.is_success() {
                bail!(report.describe());
            }
        }
        Commands::Update { force } => {
            let report = watch.run_update_check(force).await?;
            print_json(&report)?;
            if !report.is_success() {
                bail!(report.describe());
            }
        }
        Commands::Latest => match watch.get_latest_dataset().await? {
            Some(dataset) => println!(
                "processed_at={} unique={} removed_duplicates={} retired={}",
                dataset.processed_at,
                dataset.unique_count,
                dataset.removed_duplicates,
                dataset.retired_count
            ),
            None => println!("no dataset stored under {}", watch.data_dir().display()),
        },
        Commands::Check { jurisdiction } => {
            let results = watch.trigger_manual_check(&jurisdiction).await?;
            print_json(&results)?;
        }
        Commands::Sweep => {
            let outcome = watch.run_monitor_sweep().await?;
            print_json(&outcome)?;
        }
        Commands::Summary => {
            print_json(&watch.get_monitoring_summary().await?)?;
        }
        Commands::Digest { period } => {
            let report = watch.send_digest(period.into()).await?;
            print_json(&report)?;
        }
        Commands::Trigger { job } => {
            let scheduler = watch.build_scheduler()?;
            let run = scheduler.trigger(&job).await?;
            print_json(&run)?;
            if !run.succeeded() {
                bail!("job {job} did not succeed");
            }
        }
        Commands::Run => {
            let scheduler = watch.build_scheduler()?;
            info!(data_dir = %watch.data_dir().display(), "distwatch scheduler running");
            scheduler
                .run_until(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
        }
    }

    Ok(())
}
