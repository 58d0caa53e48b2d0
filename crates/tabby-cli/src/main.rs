use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tabby_storage::SnapshotStore;
use tabby_sync::{build_scheduler, diff_snapshot_files, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tabby")]
#[command(about = "Track new AAVSO observations of a single star")]
struct Cli {
    /// YAML config file; TABBY_* environment variables override it
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Directory holding MASTER/ADDED snapshot files
    #[arg(global = true, long)]
    snapshot_dir: Option<PathBuf>,

    /// Read saved `page-<n>.html` files from this directory instead of the web
    #[arg(global = true, long)]
    fixtures: Option<PathBuf>,

    /// Enable debug logging
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape once, write the new master and the additions
    Sync {
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run on the configured cron schedule until interrupted
    Watch,
    /// Print rows of CURRENT that are new relative to PREVIOUS
    Diff { previous: PathBuf, current: PathBuf },
    /// Show the newest master snapshot
    Latest,
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_yaml_file(path)?,
        None => SyncConfig::from_env(),
    };
    if let Some(dir) = &cli.snapshot_dir {
        config.snapshot_dir = dir.clone();
    }
    if let Some(dir) = &cli.fixtures {
        config.fixtures_dir = Some(dir.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let summary = SyncPipeline::new(config)?.run_once().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run summary")?
                );
            } else {
                println!(
                    "sync complete: run_id={} pages={} master={} added={} duplicates={}",
                    summary.run_id,
                    summary.pages_fetched,
                    summary.master_records,
                    summary.added_records,
                    summary.duplicates_dropped
                );
                println!("master: {}", summary.master_path);
                println!("added:  {}", summary.added_path);
            }
        }
        Commands::Watch => {
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let cron = pipeline.config().sync_cron.clone();
            let mut sched = build_scheduler(Arc::clone(&pipeline)).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "watching; press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Diff { previous, current } => {
            for obs in diff_snapshot_files(&previous, &current).await? {
                println!("{}", obs.to_row());
            }
        }
        Commands::Latest => {
            let store = SnapshotStore::new(config.snapshot_dir);
            match store.latest_master().await? {
                Some(loaded) => {
                    let newest = loaded
                        .observations
                        .first()
                        .map(|o| format!("{} ({})", o.timestamp(), o.calendar_label()))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}: {} records, newest {}",
                        loaded.path.display(),
                        loaded.observations.len(),
                        newest
                    );
                }
                None => println!("no master snapshot in {}", store.root().display()),
            }
        }
    }

    Ok(())
}
