// Health and capabilities routes

use axum::{extract::State, routing::get, Json, Router};

use spine_core::{Capabilities, Tier};
use spine_runtime::{CheckHealth, GetCapabilities, HealthReport};
use spine_storage::Database;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub tier: Tier,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/capabilities", get(capabilities))
        .with_state(state)
}

/// Liveness, readiness, DB connectivity
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthReport)),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(CheckHealth.execute(&state.db).await)
}

/// Tier feature flags
#[utoipa::path(
    get,
    path = "/v1/capabilities",
    responses((status = 200, body = Capabilities)),
    tag = "health"
)]
pub async fn capabilities(State(state): State<AppState>) -> Json<Capabilities> {
    Json(GetCapabilities { tier: state.tier }.execute())
}
