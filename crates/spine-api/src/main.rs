// Spine API server
// Thin HTTP adapter over the command layer; no business logic lives here.

mod dlq;
mod error;
mod health;
mod pipelines;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use spine_core::{config::init_tracing, Capabilities, CoreConfig};
use spine_runtime::Runtime;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::capabilities,
        pipelines::list_pipelines,
        pipelines::describe_pipeline,
        pipelines::run_pipeline,
        dlq::list_dlq,
        dlq::retry_dlq,
        dlq::resolve_dlq,
    ),
    components(schemas(
        Capabilities,
        spine_runtime::HealthReport,
        spine_runtime::PipelineSummary,
        spine_runtime::PipelineSpec,
        spine_runtime::ExecutionResponse,
        pipelines::RunRequest,
        dlq::DeadLetterView,
        error::ErrorBody,
    )),
    tags(
        (name = "health", description = "Liveness and capability discovery"),
        (name = "pipelines", description = "Pipeline listing and submission"),
        (name = "dlq", description = "Dead-letter inspection and replay")
    ),
    info(
        title = "Spine API",
        description = "Orchestration substrate for financial/regulatory data pipelines",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = CoreConfig::from_env().context("loading configuration")?;
    init_tracing(&config.log_level, config.log_format);

    tracing::info!(tier = %config.tier, "spine-api starting");

    let runtime = Runtime::connect(config.clone())
        .await
        .context("connecting to database")?;
    tracing::info!("connected to database");

    // Pipelines are registered explicitly at startup. The core ships none;
    // deployments link their pipeline crates and register them here.
    tracing::info!(
        pipelines = runtime.registry.len(),
        "pipeline registry initialized"
    );

    // Async tiers drive leased work through the pool; the full tier also
    // runs the scheduler.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let _worker_pool = if runtime.capabilities.async_execution {
        let pool = runtime.worker_pool();
        pool.start().await.map_err(anyhow::Error::new)?;
        tracing::info!(worker_id = pool.worker_id(), "worker pool started");
        Some(pool)
    } else {
        None
    };
    if runtime.capabilities.scheduling {
        let scheduler = runtime.scheduler();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(rx).await });
        tracing::info!("scheduler started");
    }

    let health_state = health::AppState {
        db: runtime.db.clone(),
        tier: runtime.config.tier,
    };
    let pipelines_state = pipelines::AppState {
        dispatcher: runtime.dispatcher.clone(),
    };
    let dlq_state = dlq::AppState {
        dlq: runtime.dlq.clone(),
    };

    let app = Router::new()
        .merge(health::routes(health_state))
        .merge(pipelines::routes(pipelines_state))
        .merge(dlq::routes(dlq_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("SPINE_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("listening on {addr}");

    axum::serve(listener, app).await.context("server error")?;

    let _ = shutdown_tx.send(true);
    Ok(())
}
