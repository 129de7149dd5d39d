use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use govcon_storage::PgOpportunityStore;
use govcon_sync::{IngestionCoordinator, SyncConfig};
use govcon_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "govcon-cli")]
#[command(about = "Government contracting opportunity ingest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingest, for every enabled source or only `--source`.
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Start the HTTP server, the optional startup run, and the scheduler.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source } => {
            let coordinator = connect_coordinator(&config).await?;
            let result = match source.as_deref() {
                Some(source_id) => coordinator.run_for_adapter(source_id).await?,
                None => coordinator.run_all().await?,
            };
            println!(
                "sync complete: new={} updated={} skipped={} failed_partitions={} duration_ms={}",
                result.new_count,
                result.updated_count,
                result.skipped_count,
                result.failed_partitions,
                result.duration_ms
            );
        }
        Commands::Migrate => {
            let store = PgOpportunityStore::connect(&config.database_url, 2).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let coordinator = Arc::new(connect_coordinator(&config).await?);
            govcon_sync::run_startup_source(&config, &coordinator).await;
            let scheduler = govcon_sync::build_scheduler(&config, coordinator.clone()).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!(cron_1 = %config.sync_cron_1, cron_2 = %config.sync_cron_2, "scheduler started");
            }
            govcon_web::serve(&config.bind_addr, AppState::new(coordinator)).await?;
        }
    }

    Ok(())
}

async fn connect_coordinator(config: &SyncConfig) -> Result<IngestionCoordinator> {
    let store = PgOpportunityStore::connect(&config.database_url, 5)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("applying migrations")?;
    govcon_sync::build_coordinator(config, Arc::new(store)).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
