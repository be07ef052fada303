use anyhow::Result;
use clap::{Parser, Subcommand};
use jobtrawl_sync::{SyncConfig, TriggerOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobtrawl")]
#[command(about = "Job listing scraper: scrape, enrich, migrate, serve")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape cycle over every configured target.
    Sync,
    /// Backfill detail-page fields for stored postings.
    Enrich {
        /// Rows read per keyset page; defaults to JOBTRAWL_ENRICH_PAGE_SIZE.
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Apply pending database migrations and exit.
    Migrate,
    /// Serve the HTTP API and run the scheduler.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobtrawl=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync);
    tracing::debug!(?command, "jobtrawl starting");

    match command {
        Commands::Sync => match jobtrawl_sync::run_sync_once_from_env().await? {
            TriggerOutcome::Completed(summary) => println!(
                "sync complete: run_id={} targets={} failed_targets={} inserted={} duplicates={} failed_writes={} timed_out={}",
                summary.run_id,
                summary.targets,
                summary.targets_failed,
                summary.inserted,
                summary.skipped_duplicates,
                summary.failed_writes,
                summary.timed_out
            ),
            TriggerOutcome::AlreadyRunning => println!("sync skipped: a cycle is already running"),
        },
        Commands::Enrich { page_size } => {
            let (config, services) = jobtrawl_sync::services_from_env().await?;
            let page_size = page_size.unwrap_or(config.enrich_page_size);
            match services.enricher.enrich_all(page_size).await? {
                TriggerOutcome::Completed(summary) => println!(
                    "enrich complete: run_id={} scanned={} enriched={} skipped={} unchanged={} failed={}",
                    summary.run_id,
                    summary.scanned,
                    summary.enriched,
                    summary.skipped_enriched,
                    summary.unchanged,
                    summary.failed
                ),
                TriggerOutcome::AlreadyRunning => println!("enrich skipped: already running"),
            }
        }
        Commands::Migrate => {
            jobtrawl_sync::connect_store(&SyncConfig::from_env()).await?;
            println!("migrations applied");
        }
        Commands::Serve => jobtrawl_web::serve_from_env().await?,
    }

    Ok(())
}
