//! API server using Axum

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::proxy::endpoints::EndpointTable;
use crate::proxy::rotation::ProxySelector;

use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<Metrics>,
    pub selector: Arc<dyn ProxySelector>,
    pub endpoints: Arc<EndpointTable>,
}

/// API server
pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router
    fn build_router(&self) -> Router {
        routes::create_router(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    /// Serve the metrics routes on a bound listener until shutdown
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let router = self.build_router();

        info!("Metrics server listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        info!("Metrics server shut down");
        Ok(())
    }
}
