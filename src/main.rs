//! Queuekeeper Service - Main Entry Point
//!
//! HTTP service exposing safe message operations on registered brokers.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use queuekeeper::api::{self, AppState};
use queuekeeper::connections::ConnectionRegistry;
use queuekeeper::messaging::MessageManager;
use queuekeeper::transport::DefaultConnector;
use queuekeeper::types::ServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "queuekeeper=info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = ServiceConfig::from_env();

    info!("Starting Queuekeeper v{}", env!("CARGO_PKG_VERSION"));
    info!(
        drain_batch_size = config.manager.engine.drain_batch_size,
        chunk_size = config.manager.bulk.chunk_size,
        duplicate_policy = ?config.manager.engine.duplicate_policy,
        "Engine configured"
    );

    // Initialize components
    let connector = Arc::new(DefaultConnector::new(
        config.manager.connect_timeout(),
        config.manager.receipt_timeout(),
    ));
    let registry = Arc::new(ConnectionRegistry::new(
        connector,
        config.manager.connect_timeout(),
    ));
    let manager = MessageManager::new(registry.clone(), config.manager.clone());

    if let Some(request) = config.bootstrap_connection.clone() {
        let name = request.name.clone();
        match manager.register_connection(request).await {
            Ok(connection) => info!(connection_id = %connection.id, name = %name, "Bootstrap connection registered"),
            Err(e) => warn!(name = %name, error = %e, "Bootstrap connection failed"),
        }
    }

    let state = Arc::new(AppState { manager });
    let app = api::router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.close_all().await;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
