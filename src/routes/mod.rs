use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    handlers::rollout::{abort_rollout, get_rollout_status, health_checker_handler},
    AppState,
};

pub fn rollout_router() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_rollout_status))
        .route("/abort", post(abort_rollout))
}

/// Operator control API served while a rollout runs.
pub fn control_app(state: AppState) -> Router {
    Router::new()
        .route("/api/healthchecker", get(health_checker_handler))
        .nest("/api/rollout", rollout_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
