//! Storeflow Engine Server
//!
//! Runs event-driven e-commerce workflows with pause/resume, exposing a
//! small operational API and a background resume worker.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storeflow_engine::{
    config::{AppConfig, DatabaseConfig, LogFormat, StoreBackend},
    db::{create_pool, init_schema},
    handlers,
    state::{AppState, Collaborators},
    store::{MemoryWorkflowStore, PgStore},
};

/// Initialize tracing/logging.
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,storeflow_engine=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    // Load configuration; tracing format depends on it
    let config_result = AppConfig::from_env();
    let app_config = config_result.as_ref().cloned().unwrap_or_default();
    init_tracing(app_config.log_format);
    if let Err(e) = config_result {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %app_config.host,
        port = app_config.port,
        store = ?app_config.store,
        "Starting Storeflow engine"
    );

    let workflows = Arc::new(MemoryWorkflowStore::from_dir(Path::new(
        &app_config.workflows_dir,
    ))?);
    tracing::info!(
        dir = %app_config.workflows_dir,
        count = workflows.len().await,
        "Workflows loaded"
    );

    let state = match app_config.store {
        StoreBackend::Postgres => {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            let pool = create_pool(&db_config).await?;
            init_schema(&pool).await?;
            let store = Arc::new(PgStore::new(pool.clone(), &db_config));
            AppState::new(
                app_config.clone(),
                Some(pool),
                store.clone(),
                store,
                workflows,
                Collaborators::default(),
            )
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; executions are lost on restart");
            AppState::in_memory(app_config.clone(), workflows, Collaborators::default())
        }
    };

    // Resume worker
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = if app_config.resume_worker_enabled {
        let worker = state.resume_worker();
        Some(tokio::spawn(async move { worker.run(shutdown_rx).await }))
    } else {
        tracing::info!("Resume worker disabled");
        None
    };

    let app = handlers::router(state);

    // Bind to address
    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    // Run the server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Resume worker task failed");
        }
    }

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
