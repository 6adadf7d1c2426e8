use anyhow::Result;
use clap::{Parser, Subcommand};
use grantsync_store::{PgStore, Store};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "grantsync")]
#[command(about = "Grant opportunity sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass against the configured store and source.
    Sync,
    /// Create the local tables if they do not exist yet.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = grantsync_engine::run_sync_once_from_env().await?;
            if summary.short_circuited {
                println!("sync skipped: no eligibility codes enabled");
            } else {
                println!(
                    "sync complete: run_id={} candidates={} inserted={} updated={} unchanged={}",
                    summary.run_id,
                    summary.candidates,
                    summary.grants.inserted,
                    summary.grants.updated,
                    summary.grants.unchanged
                );
            }
        }
        Commands::Migrate => {
            let config = grantsync_engine::SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            let result = store.ensure_schema().await;
            store.close().await;
            result?;
            println!("schema ensured");
        }
    }

    Ok(())
}
