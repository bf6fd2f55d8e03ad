use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parcel_enrichment::{EnrichmentConfig, EnrichmentManager};
use parcel_storage::PgStore;
use parcel_sync::{report_daily_markdown, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "parcel-cli")]
#[command(about = "Parcel listing reconciliation and enrichment bookkeeping")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every enabled source once and write run reports.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Run syncs on the configured cron expressions until interrupted.
    Schedule,
    /// Print the enrichment status of each address hash.
    Status {
        #[arg(required = true)]
        hashes: Vec<String>,
    },
    /// Mark enrichment states with no active listing as orphaned.
    Orphans,
    /// List addresses locked for enrichment longer than a threshold.
    StaleLocks {
        #[arg(long, default_value_t = 900)]
        older_than_secs: u64,
    },
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 1)]
        runs: usize,
    },
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, config.max_connections)
        .await
        .context("connecting to database")
}

async fn enrichment_manager(config: &SyncConfig) -> Result<EnrichmentManager> {
    let store = connect(config).await?;
    Ok(EnrichmentManager::new(Arc::new(store), EnrichmentConfig::from_env()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = connect(&config).await?;
            let summary = SyncPipeline::new(config, Arc::new(store)).run_once().await?;
            for stats in &summary.stats {
                println!(
                    "{}: scraped={} added={} updated={} removed={} unchanged={} skipped={} duplicates={} failed={}",
                    stats.source_id,
                    stats.scraped,
                    stats.added,
                    stats.updated,
                    stats.removed,
                    stats.unchanged,
                    stats.skipped,
                    stats.duplicates,
                    stats.failed
                );
            }
            println!(
                "sync complete: run_id={} sources={} skipped_sources={} reports={}",
                summary.run_id,
                summary.enabled_sources,
                summary.skipped_sources.len(),
                summary.reports_dir
            );
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let store = connect(&config).await?;
            let pipeline = Arc::new(SyncPipeline::new(config, Arc::new(store)));
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set PARCEL_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Status { hashes } => {
            let manager = enrichment_manager(&config).await?;
            let statuses = manager.statuses(&hashes).await?;
            let owners = manager.owner_records(&hashes).await?;
            for hash in &hashes {
                let status = statuses
                    .get(hash)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "invalid".to_string());
                let owner = owners
                    .get(hash)
                    .and_then(|o| o.owner_name.as_deref())
                    .unwrap_or("-");
                println!("{hash}\t{status}\t{owner}");
            }
        }
        Commands::Orphans => {
            let orphaned = enrichment_manager(&config).await?.mark_orphans().await?;
            for hash in &orphaned {
                println!("{hash}");
            }
            println!("orphaned: {}", orphaned.len());
        }
        Commands::StaleLocks { older_than_secs } => {
            let stale = enrichment_manager(&config)
                .await?
                .stale_locks(Duration::from_secs(older_than_secs))
                .await?;
            for state in &stale {
                let locked_at = state
                    .locked_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("{}\t{}\t{}", state.address_hash, state.status, locked_at);
            }
            println!("stale locks: {}", stale.len());
        }
        Commands::Report { runs } => {
            let report = report_daily_markdown(runs, Some(config.workspace_root.clone()))?;
            println!("{report}");
        }
    }

    Ok(())
}
