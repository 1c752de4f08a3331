//! Model Indexer - Main Process
//!
//! Wires the in-memory graph backend, the configured repositories and the
//! synchronization controller together.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use model_indexer::events::{EventBus, LoggingListener};
use model_indexer::graph::{GraphBackend, InMemoryBackend};
use model_indexer::index::IndexQuery;
use model_indexer::model::Metamodel;
use model_indexer::{repository, Config, InstanceRecord, SyncController};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "model-indexer")]
#[command(about = "Incremental graph index over model repositories")]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, env = "INDEXER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor the configured repositories until interrupted
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Query a named index of the persisted graph
    Query {
        index: String,
        key: String,
        /// Exact value, or a pattern containing `*`
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,model_indexer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_yaml_and_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { once } => run(config, once).await,
        Commands::Query { index, key, value } => query(config, &index, &key, &value).await,
    }
}

async fn run(config: Config, once: bool) -> Result<()> {
    let backend = Arc::new(
        InMemoryBackend::open(&config.graph_path())
            .await
            .context("Failed to open graph snapshot")?,
    );
    let bus = Arc::new(EventBus::default());

    let mut builder = SyncController::builder(backend)
        .settings(config.sync_settings())
        .listener(Arc::new(LoggingListener))
        .listener(bus.clone())
        .instance_path(config.instance_path());

    // Repositories from a previous run first, then any new ones from config
    let mut locations = Vec::new();
    let previous = InstanceRecord::load(&config.instance_path())?
        .map(|r| r.repositories)
        .unwrap_or_default();
    for repo in previous.iter().chain(config.repositories.iter()) {
        if locations.contains(&repo.location) {
            continue;
        }
        builder = builder.repository(repository::open(repo)?);
        locations.push(repo.location.clone());
    }
    let controller = builder.build();

    let metamodels = config
        .metamodels
        .iter()
        .map(|p| Metamodel::from_file(p))
        .collect::<Result<Vec<_>>>()?;
    if !metamodels.is_empty() {
        let added = controller.register_metamodels(&metamodels).await?;
        tracing::info!("Registered {} metamodels", added.len());
    }

    if once {
        let report = controller.run_cycle().await?;
        tracing::info!(
            "Cycle complete: {} repositories, {} failures, {} proxies resolved",
            report.repositories.len(),
            report.failures(),
            report.proxies_resolved
        );
        return Ok(());
    }

    controller.start();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");
    controller.stop().await;
    controller
        .wait_for(model_indexer::SyncState::Stopped, std::time::Duration::from_secs(30))
        .await;
    controller.backend().flush().await
}

async fn query(config: Config, index: &str, key: &str, value: &str) -> Result<()> {
    let backend = InMemoryBackend::open(&config.graph_path()).await?;
    let hits = backend
        .index_query(index, key, &IndexQuery::parse(value))
        .await?;
    for hit in hits {
        println!("{}", serde_json::to_string(&hit)?);
    }
    Ok(())
}
