//! Take lifecycle endpoints
//!
//! Thin HTTP wrapper around the orchestrator's `start`/`stop`/`status`
//! contract (spec.md S4.7). The engine's public entry points never raise;
//! a failed `start`/`stop` surfaces here as a 4xx/5xx with the error's
//! `Display` message, per spec.md S7's propagation policy.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::application::use_cases::OrchestratorError;
use crate::infrastructure::server::AppState;

#[derive(Debug, Deserialize)]
pub struct StartTakeRequest {
    pub reference_take_id: i64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn orchestrator_error_response(error: OrchestratorError) -> Response {
    let status = match error {
        OrchestratorError::EmptyTake(_) | OrchestratorError::NoReferenceTake(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::AlreadyRunning | OrchestratorError::NotRunning => StatusCode::CONFLICT,
        OrchestratorError::Collaborator(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(ErrorBody { error: error.to_string() })).into_response()
}

pub async fn start_take(
    Path(take_id): Path<i64>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartTakeRequest>,
) -> Response {
    let orchestrator = state.orchestrator(take_id).await;
    match orchestrator.start(body.reference_take_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => orchestrator_error_response(e),
    }
}

pub async fn stop_take(Path(take_id): Path<i64>, State(state): State<Arc<AppState>>) -> Response {
    let orchestrator = state.orchestrator(take_id).await;
    match orchestrator.stop().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => orchestrator_error_response(e),
    }
}

pub async fn take_status(Path(take_id): Path<i64>, State(state): State<Arc<AppState>>) -> Response {
    let orchestrator = state.orchestrator(take_id).await;
    Json(orchestrator.status()).into_response()
}
