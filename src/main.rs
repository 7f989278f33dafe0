//! CAMF Detector Orchestration Engine
//!
//! Entry point for the embeddable engine binary: loads `EngineConfig`,
//! builds the engine's long-lived services, and serves the HTTP/WebSocket
//! surface described in SPEC_FULL.md S10.4.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture principles:
//! - **Domain**: entities, value objects, and the collaborator traits
//!   (`FrameSource`, `ResultSink`, `VideoSource`) storage/capture implement.
//! - **Application**: the nine engine components (C1-C9) and the
//!   orchestrator/batch-pipeline use cases that drive them.
//! - **Infrastructure**: config loading, the filesystem reference storage
//!   adapter, and the axum HTTP/WS server.

use anyhow::Result;
use camf_detector_engine::infrastructure::config::EngineConfig;
use camf_detector_engine::infrastructure::server::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting camf-detector-engine v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load()?;
    let server = Server::new(config).await?;

    server.run().await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camf_detector_engine=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
