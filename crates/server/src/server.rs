//! Server implementation that runs the API and the scheduling engine
//! concurrently.

use std::future::Future;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use belfry_core::{BelfryError, Result, TimerEngine};
use tokio::sync::oneshot;

use crate::api::{self, AppState};
use crate::config::ServerConfig;

/// The belfry server: HTTP API plus the timer engine pipeline.
pub struct Server {
    config: ServerConfig,
    engine: Arc<TimerEngine>,
}

impl Server {
    pub fn new(config: ServerConfig, engine: Arc<TimerEngine>) -> Self {
        Self { config, engine }
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Run until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
    }

    /// Run until `shutdown` resolves, then stop the engine gracefully and
    /// shut the API server down.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let app_state = web::Data::new(AppState {
            service: Arc::new(self.engine.service()),
        });

        // Channel to signal API server shutdown
        let (tx, rx) = oneshot::channel::<()>();

        let api_addr = self.config.api_addr;
        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .configure(api::configure)
        })
        .bind(api_addr)
        .map_err(|e| BelfryError::Config(format!("Failed to bind {}: {}", api_addr, e)))?
        .disable_signals()
        .run();

        let api_handle = tokio::spawn(async move {
            let server_handle = server.handle();
            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "API server error");
                    }
                }
                _ = rx => {
                    tracing::info!("Shutting down API server...");
                    server_handle.stop(true).await;
                }
            }
        });

        tracing::info!(addr = %api_addr, "API server started");

        // Run the engine until shutdown (this blocks), then stop the API.
        let engine_result = self.engine.run_until(shutdown).await;

        let _ = tx.send(());
        let _ = api_handle.await;

        tracing::info!("Server stopped");
        engine_result
    }
}

/// Builder for Server.
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    engine: Option<Arc<TimerEngine>>,
}

impl ServerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the engine.
    pub fn engine(mut self, engine: Arc<TimerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the API bind address.
    pub fn api_addr(mut self, addr: std::net::SocketAddr) -> Self {
        self.config.api_addr = addr;
        self
    }

    /// Build the server.
    pub fn build(self) -> Result<Server> {
        let engine = self
            .engine
            .ok_or_else(|| BelfryError::Config("Engine is required".to_string()))?;
        Ok(Server {
            config: self.config,
            engine,
        })
    }
}
