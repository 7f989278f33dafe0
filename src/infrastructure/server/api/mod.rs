//! API Routes
//!
//! REST endpoint definitions for the engine's external surface
//! (SPEC_FULL.md S10.4): take lifecycle control and detector registry
//! listing. Liveness lives at `/health` outside this nest; see
//! `infrastructure::server::Server::run`.

pub mod health;
pub mod takes;
pub mod detectors;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::infrastructure::server::AppState;

/// Creates the `/api/v1` route table.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/takes/:id/start", post(takes::start_take))
        .route("/takes/:id/stop", post(takes::stop_take))
        .route("/takes/:id/status", get(takes::take_status))
        .route("/detectors", get(detectors::list_detectors))
}
