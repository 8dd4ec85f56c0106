//! HTTP listener for the liveness endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use loomwatch_common::HealthSnapshot;
use tokio::sync::watch;
use tracing::info;

use crate::liveness::LivenessBoard;

/// Create the HTTP router.
pub fn create_router(liveness: Arc<LivenessBoard>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(liveness)
}

/// Handler for the /health endpoint.
async fn health_handler(State(liveness): State<Arc<LivenessBoard>>) -> Json<HealthSnapshot> {
    Json(liveness.snapshot())
}

/// Liveness HTTP server.
pub struct HealthServer {
    liveness: Arc<LivenessBoard>,
    listen_addr: SocketAddr,
}

impl HealthServer {
    pub fn new(liveness: Arc<LivenessBoard>, listen_addr: SocketAddr) -> Self {
        Self {
            liveness,
            listen_addr,
        }
    }

    /// Serve until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.liveness);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "Health endpoint listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("Health endpoint stopped");
        Ok(())
    }
}
