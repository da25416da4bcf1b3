use std::sync::Arc;
use std::time::Duration;

use aim_client::{ClientConfig, InventoryClient, InventorySource};
use aim_core::SyncScope;
use aim_sync::{
    BreakerConfig, CircuitBreaker, EngineConfig, GuardConfig, LoadGuard, MirrorStore,
    PgMirrorStore, SchedulerConfig, SyncConfig, SyncEngine, SyncScheduler, SyncService,
};
use aim_web::AppState;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aim-cli")]
#[command(about = "Asset inventory mirror command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web API and, if enabled, the daily sync scheduler.
    Serve,
    /// Run one sync and exit.
    Sync {
        #[arg(long, default_value = "all")]
        scope: SyncScope,
    },
    /// Apply mirror schema migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Sync { scope } => sync_once(config, scope).await,
        Commands::Migrate => migrate(config).await,
    }
}

fn build_client(config: &SyncConfig) -> Result<InventoryClient> {
    let mut client_config = ClientConfig::new(&config.source_url, &config.source_token);
    client_config.timeout = Duration::from_secs(config.http_timeout_secs);
    client_config.ca_bundle = config.ca_bundle.clone();
    InventoryClient::new(client_config)
}

async fn connect_store(config: &SyncConfig) -> Result<PgMirrorStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for this command")?;
    let store = PgMirrorStore::connect(url).await?;
    store.run_migrations().await?;
    Ok(store)
}

fn build_service(config: &SyncConfig, client: InventoryClient, store: PgMirrorStore) -> Arc<SyncService> {
    let engine = SyncEngine::new(
        Arc::new(client) as Arc<dyn InventorySource>,
        Arc::new(store) as Arc<dyn MirrorStore>,
        EngineConfig::from_sync_config(config),
    );
    let breaker = CircuitBreaker::new(BreakerConfig {
        failure_threshold: config.breaker_threshold,
        cooldown: Duration::from_secs(config.breaker_cooldown_secs),
    });
    let guard = LoadGuard::with_host_sampler(GuardConfig {
        cpu_threshold: config.cpu_threshold,
        memory_threshold: config.memory_threshold,
        defer: Duration::from_secs(config.load_defer_secs),
    });
    Arc::new(SyncService::new(engine, breaker, guard))
}

async fn serve(config: SyncConfig) -> Result<()> {
    let client = build_client(&config)?;
    let store = connect_store(&config).await?;
    let pool = store.pool().clone();
    let service = build_service(&config, client, store);
    let scheduler = Arc::new(SyncScheduler::new(
        service,
        SchedulerConfig::from_sync_config(&config),
    ));

    if config.scheduler_enabled {
        scheduler.start().await?;
    }

    let state = AppState::new(Some(pool), Arc::clone(&scheduler));
    let port = config.web_port;
    tokio::select! {
        result = aim_web::serve(state, port) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            scheduler.stop().await?;
        }
    }
    Ok(())
}

async fn sync_once(config: SyncConfig, scope: SyncScope) -> Result<()> {
    let client = build_client(&config)?;
    let store = connect_store(&config).await?;
    let service = build_service(&config, client, store);

    let report = service.run(scope).await?;
    println!(
        "sync complete: run_id={} scope={} rows={} conflicts_repaired={}",
        report.run_id,
        report.scope,
        report.rows_upserted(),
        report
            .assets
            .as_ref()
            .map(|s| s.conflicts_repaired)
            .unwrap_or(0)
    );
    Ok(())
}

async fn migrate(config: SyncConfig) -> Result<()> {
    connect_store(&config).await?;
    println!("migrations applied");
    Ok(())
}
