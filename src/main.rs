use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cthulu_broker::broker::Broker;
use cthulu_broker::config::Config;
use cthulu_broker::runtime::spawn::tokio_spawner::TokioSpawner;
use cthulu_broker::server::build_router;

/// AI CLI session broker daemon.
#[derive(Parser, Debug)]
#[command(name = "cthulu-broker")]
enum Cli {
    /// Start the HTTP+WebSocket broker (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = std::env::args().nth(1).map(|_| Cli::parse()).unwrap_or(Cli::Serve);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(true))
        .init();

    let Cli::Serve = cli;

    let config = Config::from_env();
    tracing::info!(environment = %config.environment, port = config.port, data_dir = %config.data_dir.display(), "starting broker");

    let store = Arc::new(cthulu_broker::store::Store::open(&config.db_path())?);
    store.init()?;

    let spawner = Arc::new(TokioSpawner);
    let broker = Arc::new(Broker::new(store, spawner, &config));

    let demoted = broker.recover_from_restart().await?;
    if demoted > 0 {
        tracing::warn!(demoted, "recovered from unclean shutdown");
    }

    let reaper = broker.clone().spawn_idle_reaper(config.idle_reap_interval_secs);

    let app = build_router(broker.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let shutdown_broker = broker.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, suspending live sessions");
            reaper.abort();
            if let Err(err) = shutdown_broker.shutdown().await {
                tracing::error!(%err, "error during shutdown");
            }
        })
        .await?;

    Ok(())
}
