use crate::{
    config::ServerConfig,
    error::{PresenceError, Result},
    service::PresenceService,
};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers::{
    health_handler, history_handler, index_handler, status_handler, upload_handler,
};

/// Shared state for the Axum server
#[derive(Clone)]
pub struct ServerState {
    pub(crate) service: Arc<PresenceService>,
}

/// HTTP front end accepting camera uploads
pub struct PresenceServer {
    pub(crate) config: ServerConfig,
    pub(crate) service: Arc<PresenceService>,
}

impl PresenceServer {
    pub fn new(config: ServerConfig, service: Arc<PresenceService>) -> Self {
        Self { config, service }
    }

    /// Routes without a listener, for embedding and tests
    pub fn router(&self) -> Router {
        let state = ServerState {
            service: Arc::clone(&self.service),
        };

        Router::new()
            .route("/", get(index_handler))
            .route("/uploads", post(upload_handler))
            .route("/status", get(status_handler))
            .route("/history", get(history_handler))
            .route("/health", get(health_handler))
            .layer(DefaultBodyLimit::max(self.config.max_upload_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let addr = format!("{}:{}", self.config.ip, self.config.port);

        info!("Starting presence server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| PresenceError::system(format!("failed to bind {}: {}", addr, e)))?;

        info!(
            "Presence server listening on {} (method '{}')",
            addr,
            self.service.detector_label()
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| PresenceError::system(format!("server error: {}", e)))?;

        info!("Presence server stopped");
        Ok(())
    }
}

/// Presence server builder
#[derive(Default)]
pub struct PresenceServerBuilder {
    config: Option<ServerConfig>,
    service: Option<Arc<PresenceService>>,
}

impl PresenceServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn service(mut self, service: Arc<PresenceService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn build(self) -> Result<PresenceServer> {
        let config = self
            .config
            .ok_or_else(|| PresenceError::system("Server configuration is required"))?;
        let service = self
            .service
            .ok_or_else(|| PresenceError::system("Presence service is required"))?;

        Ok(PresenceServer::new(config, service))
    }
}
