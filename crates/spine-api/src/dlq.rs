// Dead-letter queue routes

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use spine_runtime::{DlqService, ExecutionResponse};
use spine_storage::models::DeadLetter;
use spine_storage::Pagination;

use crate::error::{ApiError, ApiResult};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub dlq: Arc<DlqService>,
}

/// Query parameters for listing dead letters
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListParams {
    pub pipeline: Option<String>,
    #[serde(default)]
    pub include_resolved: bool,
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Serializable dead-letter view
#[derive(Debug, Serialize, ToSchema)]
pub struct DeadLetterView {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub pipeline: String,
    pub error_kind: String,
    pub error_message: String,
    pub retry_count: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub resolved: bool,
}

impl From<DeadLetter> for DeadLetterView {
    fn from(d: DeadLetter) -> Self {
        Self {
            id: d.id,
            execution_id: d.execution_id,
            pipeline: d.pipeline,
            error_kind: d.error_kind,
            error_message: d.error_message,
            retry_count: d.retry_count,
            created_at: d.created_at,
            resolved: d.resolved_at.is_some(),
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/dlq", get(list_dlq))
        .route("/v1/dlq/:id/retry", post(retry_dlq))
        .route("/v1/dlq/:id/resolve", post(resolve_dlq))
        .with_state(state)
}

/// List dead letters
#[utoipa::path(
    get,
    path = "/v1/dlq",
    responses((status = 200, body = [DeadLetterView])),
    tag = "dlq"
)]
pub async fn list_dlq(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<DeadLetterView>>> {
    let entries = state
        .dlq
        .list(
            params.pipeline,
            params.include_resolved,
            Pagination {
                offset: params.offset,
                limit: params.limit,
            },
        )
        .await
        .map_err(ApiError)?;
    Ok(Json(entries.into_iter().map(DeadLetterView::from).collect()))
}

/// Replay a dead letter as a fresh execution
#[utoipa::path(
    post,
    path = "/v1/dlq/{id}/retry",
    params(("id" = Uuid, Path, description = "Dead letter id")),
    responses(
        (status = 200, body = ExecutionResponse),
        (status = 404, body = crate::error::ErrorBody)
    ),
    tag = "dlq"
)]
pub async fn retry_dlq(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionResponse>> {
    let execution = state.dlq.retry(id).await.map_err(ApiError)?;
    Ok(Json(ExecutionResponse {
        execution_id: Some(execution.id),
        pipeline: execution.pipeline,
        status: Some(execution.status),
        logical_key: execution.logical_key,
        dry_run: false,
        metrics: execution.metrics,
        error_kind: execution.error_kind,
        error_message: execution.error_message,
    }))
}

/// Mark a dead letter resolved
#[utoipa::path(
    post,
    path = "/v1/dlq/{id}/resolve",
    params(("id" = Uuid, Path, description = "Dead letter id")),
    responses((status = 200), (status = 404, body = crate::error::ErrorBody)),
    tag = "dlq"
)]
pub async fn resolve_dlq(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let resolved = state.dlq.resolve(id).await.map_err(ApiError)?;
    Ok(Json(serde_json::json!({ "resolved": resolved })))
}
