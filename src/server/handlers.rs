use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::broadcaster::{LoopState, LoopStatus};
use crate::server::state::AppState;

/// Health check endpoint; unhealthy once the loop has terminated
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.status.read().await.state {
        LoopState::Terminated => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcasterStatus {
    pub home_cluster_id: String,
    pub uptime_secs: i64,
    pub sharing_percentage: u8,
    #[serde(flatten)]
    pub broadcast: LoopStatus,
}

/// Broadcast loop status endpoint
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let broadcast = state.status.read().await.clone();
    let sharing_percentage = state.config.borrow().sharing_percentage;
    Json(BroadcasterStatus {
        home_cluster_id: state.home_cluster_id.clone(),
        uptime_secs: state.uptime_secs(),
        sharing_percentage,
        broadcast,
    })
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
