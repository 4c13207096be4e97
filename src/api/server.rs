//! HTTP server hosting the read API

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::claim::ClaimManager;
use crate::config::ApiConfig;

use super::create_router;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Lease operations and the store behind them
    pub manager: Arc<ClaimManager>,

    /// Reported by the health endpoint when this process also collects
    pub instance_id: Option<String>,

    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    pub fn new(manager: Arc<ClaimManager>) -> Self {
        Self {
            manager,
            instance_id: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Bound on each store read
    pub(crate) fn timeout(&self) -> Duration {
        self.manager.config().store_timeout()
    }
}

// ============================================================================
// API Server
// ============================================================================

/// Read API server
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Result<Self, ServerError> {
        config
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|e| ServerError::ConfigError(format!("{}: {e}", config.bind_address)))?;
        Ok(Self { config, state })
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Serve until `shutdown_signal` resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let addr = &self.config.bind_address;

        tracing::info!(address = %addr, "Starting read API server");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()))?;

        tracing::info!("Read API server shutdown complete");
        Ok(())
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// Server errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to bind: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    ServeError(String),
}

// ============================================================================
// Tests
// ============================================================================
