use anyhow::Result;
use apd_store::Store;
use apd_sync::{SyncConfig, SyncEngine};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "apd-cli")]
#[command(about = "Ads performance dashboard command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full campaign -> ad set -> insight sync once.
    Sync,
    /// Apply pending database migrations.
    Migrate,
    /// Serve the dashboard API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let config = SyncConfig::from_env()?;
            let engine = SyncEngine::from_config(&config).await?;
            let summary = engine.sync_all().await?;
            println!(
                "sync complete: run_id={} campaigns={} ad_sets={} metrics={} discarded={}",
                summary.run_id,
                summary.campaigns.written,
                summary.ad_sets.written,
                summary.metrics.written,
                summary.campaigns.discarded + summary.ad_sets.discarded + summary.metrics.discarded,
            );
        }
        Commands::Migrate => {
            let database_url =
                std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://apd.db".to_string());
            let store = Store::connect(&database_url).await?;
            store.migrate().await?;
            info!(%database_url, "migrations applied");
        }
        Commands::Serve => {
            apd_web::serve_from_env().await?;
        }
    }

    Ok(())
}
