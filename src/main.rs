use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scrapefleet::config::Config;
use scrapefleet::coordination::{MemoryCoordination, RedisCoordination, SharedCoordination};
use scrapefleet::coordinator::CoordinatorServer;
use scrapefleet::events::EventPublisher;
use scrapefleet::lock::TaskLockManager;
use scrapefleet::storage::{MemoryStore, PostgresStore, SharedStateStore};
use scrapefleet::worker::{WorkerConfig, WorkerRunner};

#[derive(Parser)]
#[command(
    name = "scrapefleet",
    version,
    about = "Distributed scraping task coordinator and worker",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator HTTP service
    Serve {
        /// TOML configuration file (environment variables otherwise)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Keep all state in memory instead of PostgreSQL and Redis
        #[arg(long, default_value = "false")]
        in_memory: bool,
    },

    /// Run a worker process (configured from the environment)
    Worker,

    /// Run one lease reconciliation pass and exit
    Sweep {
        /// TOML configuration file (environment variables otherwise)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Create the database schema and exit
    Migrate {
        /// TOML configuration file (environment variables otherwise)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    match cli.command {
        Commands::Serve { config, in_memory } => {
            tracing::info!(config = ?config, in_memory, "Starting serve command");
            serve(config, in_memory).await?;
        }
        Commands::Worker => {
            tracing::info!("Starting worker command");
            worker().await?;
        }
        Commands::Sweep { config } => {
            tracing::info!(config = ?config, "Starting sweep command");
            sweep(config).await?;
        }
        Commands::Migrate { config } => {
            tracing::info!(config = ?config, "Starting migrate command");
            migrate(config).await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("scrapefleet=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new("scrapefleet=info,warn")
        }
    });

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(&path)?,
        None => Config::from_env()?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn connect_stores(config: &Config) -> Result<(SharedStateStore, SharedCoordination)> {
    let store = PostgresStore::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    store.migrate().await.context("Failed to apply schema")?;

    let coordination = RedisCoordination::connect(&config.coordination)
        .await
        .context("Failed to connect to Redis")?;

    Ok((Arc::new(store), Arc::new(coordination)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

async fn serve(config_path: Option<PathBuf>, in_memory: bool) -> Result<()> {
    let config = load_config(config_path)?;

    if let Err(e) = scrapefleet::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let (store, coordination): (SharedStateStore, SharedCoordination) = if in_memory {
        tracing::warn!("Running with in-memory state; nothing survives a restart");
        (Arc::new(MemoryStore::new()), Arc::new(MemoryCoordination::new()))
    } else {
        connect_stores(&config).await?
    };

    let server = CoordinatorServer::new(&config, store, coordination)?;
    println!("{}", server.info().display());

    server.start_with_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn worker() -> Result<()> {
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    println!("{}", config.display());

    let coordination = RedisCoordination::connect(&config.coordination)
        .await
        .context("Failed to connect to Redis")?;

    let runner = WorkerRunner::new(config, Arc::new(coordination))?;

    let signal_runner = runner.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_runner.request_shutdown();
    });

    let summary = runner.run().await?;
    println!(
        "Worker stopped: {} task(s) processed, {} aborted",
        summary.processed_count, summary.aborted
    );
    Ok(())
}

async fn sweep(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let (store, coordination) = connect_stores(&config).await?;

    let lock = TaskLockManager::new(
        store,
        coordination.clone(),
        EventPublisher::new(coordination),
        config.lease.clone(),
    );
    let report = lock.run_sweep().await?;

    println!(
        "Sweep finished: {} orphan lease(s) repaired, {} stale task(s) failed",
        report.repaired, report.stale_failed
    );
    Ok(())
}

async fn migrate(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let store = PostgresStore::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    store.migrate().await?;

    println!("Schema is up to date");
    Ok(())
}
