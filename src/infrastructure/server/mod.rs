//! HTTP Server
//!
//! Axum-based web server exposing the engine's external surface per
//! SPEC_FULL.md S10.4: take lifecycle control, detector registry listing,
//! liveness, and the event-bus WebSocket bridge.

mod api;
mod app_state;
mod websocket;

pub use app_state::AppState;

use anyhow::Result;
use axum::http::HeaderValue;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::infrastructure::config::EngineConfig;

/// HTTP server embedding the detector orchestration engine.
pub struct Server {
    config: EngineConfig,
    state: Arc<AppState>,
}

impl Server {
    /// Creates a new server instance, constructing the engine's services.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let state = AppState::new(&config).await?;

        Ok(Self {
            config,
            state: Arc::new(state),
        })
    }

    /// Runs the server until the listener is closed.
    pub async fn run(self) -> Result<()> {
        let cors = match self.config.cors_origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new().allow_origin(origin).allow_methods(Any).allow_headers(Any),
            Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
        };

        let app = Router::new()
            .route("/health", get(api::health::health_check))
            .nest("/api/v1", api::routes())
            .route("/ws", get(websocket::ws_handler))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state);

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!("camf-detector-engine listening on http://{}", addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}
