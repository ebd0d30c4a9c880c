mod auth;
mod config;
mod error;
mod routes;

use std::sync::Arc;

use config::AppConfig;
use fieldsync_core::analysis::HttpAnalysisClient;
use fieldsync_core::db::Database;
use fieldsync_core::queue::{DispatchQueue, DispatchWorker};
use routes::{app_router, AppState};
use tokio::sync::{broadcast, Notify};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fieldsync_api=info".parse()?)
                .add_directive("fieldsync_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting fieldsync-api with config: {:?}", config);

    let db = if config.database_path == ":memory:" {
        Database::open_in_memory()?
    } else {
        Database::open(&config.database_path)?
    };
    let work_available = Arc::new(Notify::new());
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let worker_handle = match &config.analysis {
        Some(analysis) => {
            let client = HttpAnalysisClient::new(analysis.clone())?;
            tracing::info!(endpoint = client.endpoint(), "Analysis dispatch enabled");
            let queue = DispatchQueue::new(db.clone(), Arc::new(client), config.queue.clone());
            let worker = DispatchWorker::new(Arc::new(queue), Arc::clone(&work_available));
            let shutdown_rx = shutdown_tx.subscribe();
            Some(tokio::spawn(async move { worker.run(shutdown_rx).await }))
        }
        None => {
            tracing::warn!("ANALYSIS_SERVICE_URL is not set; high-risk cases will stay queued");
            None
        }
    };

    let state = AppState::new(Arc::clone(&config), db, work_available);
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("fieldsync-api listening on {}", bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(());
    if let Some(handle) = worker_handle {
        handle.await?;
    }
    Ok(())
}
