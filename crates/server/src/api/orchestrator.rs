//! Orchestrator API handlers.

use axum::{extract::State, Json};
use std::sync::Arc;
use certflow_core::OrchestratorStatus;

use crate::state::AppState;

/// Get orchestrator status: running flag, in-flight work, per-state counts
/// and the outcome of the last sweep.
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator().status().await)
}
