//! Detector registry listing endpoint (C4).

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::application::services::RegisteredPackage;
use crate::infrastructure::server::AppState;

pub async fn list_detectors(State(state): State<Arc<AppState>>) -> Json<Vec<RegisteredPackage>> {
    Json(state.registry.list())
}
