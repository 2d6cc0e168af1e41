use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use ws_isolation::compat;
use ws_isolation::config::Settings;
use ws_isolation::isolation::ManagerFactory;
use ws_isolation::server::{create_app, AppState};
use ws_isolation::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    init_tracing(&settings.log);
    tracing::info!("Configuration loaded");

    // Composition root: the one factory every component receives
    let factory = Arc::new(
        ManagerFactory::new(settings.isolation.clone())
            .with_lifecycle_config(settings.lifecycle.clone()),
    );
    compat::install_shared_factory(factory.clone());

    // Start expiry sweep in background
    factory.start_background_cleanup().await;

    let app = create_app(AppState::new(factory.clone()));

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Ops server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    tracing::info!("Cleaning up isolated managers...");
    let cleaned = factory.shutdown().await;
    compat::clear_shared_factory();

    tracing::info!(cleaned = cleaned, "Service shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
