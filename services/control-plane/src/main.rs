//! berth control plane
//!
//! Places game servers onto nodes, drives their lifecycle through the node
//! daemons and relays live console and resource streams to viewers.

use std::sync::Arc;

use anyhow::Result;
use berth_control_plane::{
    api,
    config::{self, RegistryBackend},
    daemon::HttpDaemonClient,
    db::Database,
    lifecycle::FleetController,
    registry::{MemoryRegistry, PgRegistry, Registry},
    state::AppState,
    telemetry::WsConnector,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to BERTH_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting berth control plane");
    info!(listen_addr = %config.listen_addr, registry = ?config.registry, "Configuration loaded");

    let (registry, db): (Arc<dyn Registry>, Option<Database>) = match config.registry {
        RegistryBackend::Memory => {
            warn!("Using in-memory registry; state is lost on restart");
            let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
            (registry, None)
        }
        RegistryBackend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            let registry: Arc<dyn Registry> = Arc::new(PgRegistry::new(&db));
            (registry, Some(db))
        }
    };

    let daemon = Arc::new(HttpDaemonClient::new(&config.daemon)?);
    let connector = Arc::new(WsConnector::new(config.daemon.tls, config.daemon.timeout));
    let controller = FleetController::new(registry, daemon);
    let state = AppState::new(controller, connector, config.relay.clone(), db);

    let app = api::create_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
