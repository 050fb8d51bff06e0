//! eventgate — HTTP ingestion front-end for a streaming SQL database.
//!
//! Wires the core engine together: connection pool, relation watcher,
//! ingestion dispatcher, the HTTP API, and the optional debug listener,
//! with graceful shutdown on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use eventgate_core::{
    CatalogSource, Connection, EventDispatcher, IngestMetrics, PgCatalog, PgPool,
    RelationObserver, RelationWatcher,
};
use eventgate_server::api::{self, AppState};
use eventgate_server::config::Config;
use eventgate_server::debug;

/// Bound on the shutdown drain after the listener stops accepting.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::parse();
    info!(host = %config.host, port = config.port, "starting eventgate");

    let pg = PgPool::connect(&config.database_url()).await?;
    let metrics = Arc::new(IngestMetrics::new());
    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::new(pg.clone()) as Arc<dyn Connection>,
        Arc::clone(&metrics),
    ));

    let catalog: Arc<dyn CatalogSource> = Arc::new(PgCatalog::new(pg.pool().clone()));
    let watcher = Arc::new(RelationWatcher::new(
        catalog,
        Arc::clone(&dispatcher) as Arc<dyn RelationObserver>,
    ));
    // Warm the handler map before accepting traffic.
    watcher.refresh().await?;
    info!(relations = dispatcher.handler_count(), "catalog cache warmed");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher_task = tokio::spawn({
        let watcher = Arc::clone(&watcher);
        let shutdown_rx = shutdown_rx.clone();
        async move { watcher.run(shutdown_rx).await }
    });

    let debug_task = if config.debug_enable {
        let addr = config.debug_addr();
        let metrics = Arc::clone(&metrics);
        let shutdown_rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = debug::serve(addr, metrics, shutdown_rx).await {
                warn!(error = %err, "debug server exited");
            }
        }))
    } else {
        None
    };

    let state = AppState {
        dispatcher: Arc::clone(&dispatcher),
        pool: pg.pool().clone(),
        metrics,
    };
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!(addr = %config.bind_addr(), "listening");
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
        let _ = watcher_task.await;
        if let Some(task) = debug_task {
            let _ = task.await;
        }
        dispatcher.shutdown().await;
    })
    .await;
    if drained.is_err() {
        warn!("graceful shutdown window elapsed before drain finished");
    }
    info!("bye");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
