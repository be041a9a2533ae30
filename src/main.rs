use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use kenaz::broker::Broker;
use kenaz::config::Config;
use kenaz::services::index::Index;
use kenaz::services::notes::NoteService;
use kenaz::services::reconciler;
use kenaz::services::vault::Vault;
use kenaz::{watcher, AppState};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .init();

    if let Err(e) = run(config).await {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> kenaz::error::Result<()> {
    let port = config.port;

    let vault = Arc::new(Vault::open(&config.vault_dir)?);
    let index = Arc::new(Index::open(&config.db_path)?);

    // The index must match the vault before anything is served or watched.
    let stats = reconciler::reconcile(&vault, &index, None)?;
    info!(
        indexed = stats.indexed,
        removed = stats.removed,
        skipped = stats.skipped,
        "startup reconcile complete"
    );

    let broker = Broker::start(Duration::from_secs(config.graph_throttle_secs));
    let notes = Arc::new(NoteService::new(
        vault.clone(),
        index.clone(),
        broker.clone(),
    ));
    let watcher = watcher::start(vault.clone(), index.clone(), broker.clone())?;

    let state = AppState {
        config: Arc::new(config),
        vault,
        index,
        notes,
        broker: broker.clone(),
    };
    let app = kenaz::app(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    info!("kenaz running on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    watcher.shutdown().await;
    broker.close();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
