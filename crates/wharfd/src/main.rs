//! Wharf broker daemon
//!
//! Usage:
//!
//!   # in-memory storage, default scheduler
//!   wharfd
//!
//!   # persistent storage and a public bind
//!   wharfd --listen 0.0.0.0:4080 --file-storage /var/lib/wharf/files.redb
//!
//!   # serve the provider frontend and restrict origins
//!   wharfd --static-files ./webprovider/dist \
//!     --allowed-origins https://wharf.example

mod cli;

use clap::Parser;
use cli::Cli;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wharf_broker::http::{self, AppState};
use wharf_broker::provider::ProviderRegistry;
use wharf_broker::{dispatcher, scheduler};
use wharf_core::FileStorage;

/// Queue depth between the job handlers and the dispatcher.
const TASK_QUEUE_DEPTH: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, enable_metrics, log_level) = Cli::parse().into_config();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!(?config, "starting wharf broker");

    // metrics recorder, rendered on /metrics by the router
    let metrics_handle = if enable_metrics {
        Some(metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?)
    } else {
        None
    };

    // storage, registry, selector, dispatcher
    let storage = FileStorage::open(&config.file_storage)
        .map_err(|e| anyhow::anyhow!("cannot open file storage: {e}"))?;
    let registry = ProviderRegistry::new(storage);
    let selector = scheduler::make_scheduler(config.scheduler, registry.clone());
    let (queue_tx, queue_rx) = mpsc::channel(TASK_QUEUE_DEPTH);
    tokio::spawn(dispatcher::run(queue_rx, selector, registry.clone()));

    // http surface
    let state = AppState {
        registry,
        queue: queue_tx,
        allowed_origins: Arc::new(config.allowed_origins.clone()),
        metrics: metrics_handle,
    };
    let mut router = http::router(state);
    if let Some(dir) = &config.static_files {
        router = router.fallback_service(ServeDir::new(dir));
    }

    let listener = tokio::net::TcpListener::bind(&config.http_listen).await?;
    info!("broker listening on http://{}", listener.local_addr()?);
    info!("provider socket at /api/provider/ws, client API at /api/client/run");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("goodbye!");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
