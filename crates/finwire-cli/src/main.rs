use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use finwire_storage::ArticleStore;
use finwire_sync::{build_pipeline, run_once, Runner, SnapshotStore, StopSignal, SyncConfig};
use finwire_web::AppState;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "finwire")]
#[command(about = "Finance news harvester and feed API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the periodic harvester and serve the feed API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Harvest every enabled source once and exit.
    Crawl,
    /// Create the article schema.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("finwire=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Crawl => {
            let (pipeline, sources) = build_pipeline(&config).await?;
            let snapshot = SnapshotStore::new();
            let summaries = run_once(&pipeline, &sources, &snapshot, &StopSignal::never()).await;
            for s in summaries {
                println!(
                    "crawl complete: run_id={} source={} status={:?} listed={} built={} inserted={} skipped={} failed={}",
                    s.run_id,
                    s.source_id,
                    s.status,
                    s.listed,
                    s.built,
                    s.inserted,
                    s.skipped,
                    s.fetch_failed + s.save_failed
                );
            }
        }
        Commands::Migrate => {
            let store = ArticleStore::connect(&config.database_url)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            store.migrate().await?;
            println!("schema ready: {}", config.database_url);
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig, port: Option<u16>) -> Result<()> {
    let (pipeline, sources) = build_pipeline(&config).await?;
    let snapshot = SnapshotStore::new();
    let runner = Runner::spawn(pipeline, sources, snapshot.clone(), config.poll_interval);

    let port = port.unwrap_or(config.web_port);
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    let served = finwire_web::serve(listener, AppState::new(snapshot), async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
    })
    .await;

    runner.shutdown().await;
    served
}
