use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use pulse_core::analytics::{FunnelQuery, StepSessionsQuery};

use crate::{error::AppError, state::AppState};

/// `POST /api/sites/{site_id}/funnels/evaluate`: per-step reached and
/// dropped counts for an ad-hoc funnel.
pub async fn evaluate_funnel(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    body: Result<Json<FunnelQuery>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(query) = body?;
    let _slot = state.acquire_query_slot().await?;
    let result = state
        .engine
        .evaluate_funnel(&state.query_context(), &site_id, &query)
        .await?;
    Ok(Json(json!({ "data": result })))
}

/// `POST /api/sites/{site_id}/funnels/sessions`: sessions that reached or
/// dropped at one step, paginated.
pub async fn step_sessions(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    body: Result<Json<StepSessionsQuery>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(query) = body?;
    let _slot = state.acquire_query_slot().await?;
    let page = state
        .engine
        .list_step_sessions(&state.query_context(), &site_id, &query)
        .await?;
    Ok(Json(json!({ "data": page })))
}
