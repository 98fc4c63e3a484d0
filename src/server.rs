//! HTTP server
//!
//! Serves the canvas WebSocket API backed by SQLite snapshots.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use quill_canvas::{
    canvas_router, spawn_indexing_worker, CanvasSessionManager, CanvasState, SqliteCanvasStore,
    TokioScheduler,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::indexer::HttpIndexingHook;

/// Create the directory holding a file-backed SQLite database
pub fn ensure_database_dir(url: &str) -> Result<()> {
    let Some(path) = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
    else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Open the snapshot store named in the config
pub async fn open_store(config: &AppConfig) -> Result<SqliteCanvasStore> {
    ensure_database_dir(&config.database.url)?;
    SqliteCanvasStore::connect(&config.database.url)
        .await
        .with_context(|| format!("Failed to open snapshot store at {}", config.database.url))
}

pub async fn run(config: AppConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let scheduler = Arc::new(TokioScheduler::current()?);
    let manager = Arc::new(
        CanvasSessionManager::new(config.canvas.clone(), scheduler)
            .with_persistence(Arc::new(store)),
    );

    let indexer = match &config.indexing.endpoint {
        Some(endpoint) => {
            let hook = HttpIndexingHook::new(
                endpoint.as_str(),
                Duration::from_secs(config.indexing.timeout_secs),
            )?;
            info!(endpoint = %endpoint, "indexing enabled");
            Some(spawn_indexing_worker(manager.bus(), hook))
        }
        None => None,
    };

    let app = canvas_router(Arc::new(CanvasState::new(Arc::clone(&manager))))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    let cancelled = manager.cancel_all();
    if cancelled > 0 {
        info!(cancelled, "stopped running reveals");
    }
    if let Some(conversation_id) = manager.active_conversation() {
        if let Err(e) = manager.save_conversation(&conversation_id).await {
            warn!(conversation_id = %conversation_id, error = %e, "failed to save snapshot on shutdown");
        }
    }
    if let Some(handle) = indexer {
        handle.abort();
    }

    info!("Quill shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
