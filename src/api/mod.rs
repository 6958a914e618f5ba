// src/api/mod.rs — HTTP trigger API for starting, inspecting and cancelling iterations

pub mod auth;
pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::cache::ResponseCache;
use crate::infra::config::{ApiConfig, ApiToken};
use crate::infra::errors::PipelineError;
use crate::pipeline::cost::CostTracker;
use crate::pipeline::{Orchestrator, Pipeline};
use crate::store::PipelineStore;
use types::ErrorResponse;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn PipelineStore>,
    pub costs: Arc<CostTracker>,
    pub cache: Arc<ResponseCache>,
    pub tokens: Arc<Vec<ApiToken>>,
}

impl ApiState {
    pub fn new(pipeline: &Pipeline, config: &ApiConfig) -> Self {
        Self {
            orchestrator: pipeline.orchestrator.clone(),
            store: pipeline.store.clone(),
            costs: pipeline.costs.clone(),
            cache: pipeline.providers.cache().clone(),
            tokens: Arc::new(config.tokens.clone()),
        }
    }
}

/// The one place pipeline errors become HTTP statuses. No wildcard arm: a new
/// error kind will not compile until it is mapped here.
pub fn error_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Provider { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::JudgeParse(_) => StatusCode::BAD_GATEWAY,
        PipelineError::AggregationIncomplete { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
        PipelineError::Conflict(_) => StatusCode::CONFLICT,
        PipelineError::Unauthorized => StatusCode::UNAUTHORIZED,
        PipelineError::Forbidden { .. } => StatusCode::FORBIDDEN,
        PipelineError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_kind(err: &PipelineError) -> &'static str {
    match err {
        PipelineError::Configuration(_) => "configuration",
        PipelineError::Provider { .. } => "provider",
        PipelineError::JudgeParse(_) => "judge_parse",
        PipelineError::AggregationIncomplete { .. } => "aggregation_incomplete",
        PipelineError::Validation(_) => "validation",
        PipelineError::NotFound { .. } => "not_found",
        PipelineError::Conflict(_) => "conflict",
        PipelineError::Unauthorized => "unauthorized",
        PipelineError::Forbidden { .. } => "forbidden",
        PipelineError::Store(_) => "store",
    }
}

/// Handler error wrapper so `?` works on `PipelineError`.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = error_status(&self.0);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "API request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: error_kind(&self.0).to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: ApiState) -> Router {
    let origins = [
        "http://localhost:3000",
        "http://localhost:5173",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:5173",
    ]
    .into_iter()
    .map(HeaderValue::from_static)
    .collect::<Vec<_>>();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route(
            "/api/v1/experiments/{id}/iterations",
            post(handlers::start_iteration),
        )
        .route(
            "/api/v1/experiments/{id}/cancel",
            post(handlers::cancel_experiment),
        )
        .route("/api/v1/iterations/{id}", get(handlers::get_iteration))
        .route(
            "/api/v1/iterations/{id}/cancel",
            post(handlers::cancel_iteration),
        )
        .route("/api/v1/cost", get(handlers::get_cost))
        .route("/api/v1/health", get(handlers::health))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` resolves.
pub async fn start_server(
    config: &ApiConfig,
    state: ApiState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("127.0.0.1:{}", config.port);
    let router = build_router(state);

    tracing::info!("API server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::infra::config::Config;
    use crate::provider::resolver::ProviderRegistry;
    use crate::provider::retry::RetryConfig;
    use crate::store::MemoryStore;

    fn test_state() -> ApiState {
        let cache = Arc::new(ResponseCache::new());
        let pipeline = Pipeline::new(
            Config::default(),
            Arc::new(MemoryStore::new()),
            ProviderRegistry::new(cache, RetryConfig::immediate(0)),
        )
        .unwrap();
        ApiState::new(&pipeline, &ApiConfig::default())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state());
        let req = Request::builder()
            .uri("/api/v1/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_iteration_is_404() {
        let app = build_router(test_state());
        let req = Request::builder()
            .uri("/api/v1/iterations/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&PipelineError::Conflict("busy".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&PipelineError::Configuration("no key".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            error_status(&PipelineError::AggregationIncomplete {
                iteration_id: "it".into(),
                completed: 1,
                expected: 2
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(error_status(&PipelineError::Unauthorized), StatusCode::UNAUTHORIZED);
    }
}
