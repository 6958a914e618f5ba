// src/api/handlers.rs

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use crate::api::{auth, types::*, ApiError, ApiState};
use crate::infra::errors::PipelineError;
use crate::pipeline::types::PromptVersion;
use crate::pipeline::IterationStatus;

/// POST /api/v1/experiments/{id}/iterations — Start the next iteration.
pub async fn start_iteration(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(experiment_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<IterationCreatedResponse>), ApiError> {
    let principal = auth::authenticate(&state, &headers)?;
    let experiment = state.store.experiment(&experiment_id)?;
    principal.authorize(&experiment.project_id)?;

    let body: StartIterationRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartIterationRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| PipelineError::Validation(format!("request body: {e}")))?
    };
    let version_id = body.prompt_version_id.unwrap_or_else(|| {
        PromptVersion::id_for(&experiment.id, experiment.current_version)
    });
    let iteration_id = state
        .orchestrator
        .start_iteration(&experiment.id, &version_id)?;
    tracing::info!(principal = %principal.name, %iteration_id, "Iteration triggered via API");

    Ok((
        StatusCode::CREATED,
        Json(IterationCreatedResponse {
            iteration_id,
            experiment_id: experiment.id,
            prompt_version_id: version_id,
        }),
    ))
}

/// GET /api/v1/iterations/{id} — State, per-stage counts and decision.
pub async fn get_iteration(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<IterationStatus>, ApiError> {
    let principal = auth::authenticate(&state, &headers)?;
    let status = state.orchestrator.iteration_status(&id)?;
    let experiment = state.store.experiment(&status.experiment_id)?;
    principal.authorize(&experiment.project_id)?;
    Ok(Json(status))
}

/// POST /api/v1/iterations/{id}/cancel
pub async fn cancel_iteration(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let principal = auth::authenticate(&state, &headers)?;
    let it = state.store.iteration(&id)?;
    let experiment = state.store.experiment(&it.experiment_id)?;
    principal.authorize(&experiment.project_id)?;

    let new_state = state.orchestrator.cancel_iteration(&id)?;
    Ok(Json(CancelResponse {
        iteration_id: Some(id),
        state: Some(new_state),
    }))
}

/// POST /api/v1/experiments/{id}/cancel — Cancel whatever is in flight.
pub async fn cancel_experiment(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(experiment_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let principal = auth::authenticate(&state, &headers)?;
    let experiment = state.store.experiment(&experiment_id)?;
    principal.authorize(&experiment.project_id)?;

    let cancelled = state.orchestrator.cancel_experiment(&experiment_id)?;
    let new_state = match &cancelled {
        Some(id) => Some(state.store.iteration(id)?.state),
        None => None,
    };
    Ok(Json(CancelResponse {
        iteration_id: cancelled,
        state: new_state,
    }))
}

/// GET /api/v1/cost — Provider spend and cache effectiveness.
pub async fn get_cost(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<CostSummary>, ApiError> {
    auth::authenticate(&state, &headers)?;
    Ok(Json(CostSummary {
        total_usd: state.costs.total_usd(),
        calls: state.costs.total_calls(),
        cache_hits: state.costs.cache_hits(),
        cache: state.cache.stats(),
        models: state.costs.model_breakdown(),
    }))
}

/// GET /api/v1/health — Simple health check.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
