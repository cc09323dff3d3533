//! The serving loop.

use crate::router::build_router;
use gantry_core::gateway::Gateway;
use std::{net::SocketAddr, sync::Arc};
use tokio::signal;
use tracing::{error, info};

/// Binds the listener and serves the gateway until a shutdown signal
/// arrives. The listener stops accepting, in-flight requests drain, then
/// lifecycle extensions are stopped in reverse start order.
pub async fn serve(gateway: Arc<Gateway>, port: u16) -> anyhow::Result<()> {
    let app = build_router(gateway.clone())?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, api = gateway.api_prefix(), "gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.shutdown();
    info!("gateway shutdown complete");
    Ok(())
}

/// Resolves when the process receives Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, draining in-flight requests");
}
