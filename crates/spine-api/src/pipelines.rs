// Pipeline HTTP routes

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;

use spine_core::{Lane, TriggerSource};
use spine_runtime::{
    DescribePipeline, Dispatcher, ExecutionResponse, ListPipelines, PipelineSpec,
    PipelineSummary, RunPipeline,
};

use crate::error::{ApiResult, ApiError};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Query parameters for listing pipelines
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListParams {
    pub prefix: Option<String>,
}

/// Request body for running a pipeline
#[derive(Debug, Deserialize, ToSchema)]
pub struct RunRequest {
    #[serde(default)]
    #[schema(value_type = Object)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub lane: Lane,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/pipelines", get(list_pipelines))
        .route("/v1/pipelines/:name", get(describe_pipeline))
        .route("/v1/pipelines/:name/run", axum::routing::post(run_pipeline))
        .with_state(state)
}

/// List registered pipelines
#[utoipa::path(
    get,
    path = "/v1/pipelines",
    params(("prefix" = Option<String>, Query, description = "Name prefix filter")),
    responses((status = 200, body = [PipelineSummary])),
    tag = "pipelines"
)]
pub async fn list_pipelines(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<PipelineSummary>> {
    let command = ListPipelines {
        prefix: params.prefix,
    };
    Json(command.execute(state.dispatcher.registry()))
}

/// Describe one pipeline's parameter schema
#[utoipa::path(
    get,
    path = "/v1/pipelines/{name}",
    params(("name" = String, Path, description = "Pipeline name")),
    responses(
        (status = 200, body = PipelineSpec),
        (status = 404, body = crate::error::ErrorBody)
    ),
    tag = "pipelines"
)]
pub async fn describe_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipelineSpec>> {
    let command = DescribePipeline { name };
    let spec = command.execute(state.dispatcher.registry())?;
    Ok(Json(spec))
}

/// Submit a pipeline run
#[utoipa::path(
    post,
    path = "/v1/pipelines/{name}/run",
    params(("name" = String, Path, description = "Pipeline name")),
    request_body = RunRequest,
    responses(
        (status = 200, body = ExecutionResponse),
        (status = 400, body = crate::error::ErrorBody),
        (status = 404, body = crate::error::ErrorBody),
        (status = 409, body = crate::error::ErrorBody)
    ),
    tag = "pipelines"
)]
pub async fn run_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<RunRequest>,
) -> ApiResult<Json<ExecutionResponse>> {
    let command = RunPipeline {
        name,
        params: body.params,
        lane: body.lane,
        trigger_source: TriggerSource::Http,
        idempotency_key: body.idempotency_key,
        dry_run: body.dry_run,
    };
    let response = command.execute(&state.dispatcher).await.map_err(ApiError)?;
    Ok(Json(response))
}
