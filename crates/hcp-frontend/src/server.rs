//! Frontend HTTP server

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::middleware::with_interceptors;
use crate::routes::{router, AppState};

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on
    pub addr: SocketAddr,
    /// Body ceiling for write verbs
    pub max_body_bytes: usize,
}

/// Routing table wrapped in the interceptor chain
pub fn build_app(state: AppState, max_body_bytes: usize) -> Router {
    with_interceptors(router(state), max_body_bytes)
}

/// Serve until `cancel` fires, then drain open connections
pub async fn serve(
    config: ServerConfig,
    state: AppState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.addr).await?;
    info!(addr = %listener.local_addr()?, "Starting frontend server");

    axum::serve(listener, build_app(state, config.max_body_bytes))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("Frontend server stopped");
    Ok(())
}
