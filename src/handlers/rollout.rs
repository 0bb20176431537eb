use axum::{extract::State, response::Json};
use serde_json::{json, Value};
use tracing::info;

use crate::{
    deployment::controller::RolloutStatus,
    error::Result,
    AppState,
};

pub async fn health_checker_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "success",
        "message": "Launch orchestrator is running! 🚀",
        "domain": state.controller.domain(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Current state, weights and transition history.
pub async fn get_rollout_status(State(state): State<AppState>) -> Json<RolloutStatus> {
    Json(state.controller.status().await)
}

/// Requests an operator abort of the running rollout.
pub async fn abort_rollout(State(state): State<AppState>) -> Result<Json<Value>> {
    info!("🛑 Abort requested through control API");
    state.controller.abort().await?;

    Ok(Json(json!({
        "status": "accepted",
        "message": "Abort requested; rollback starts at the next step boundary",
        "domain": state.controller.domain(),
    })))
}
