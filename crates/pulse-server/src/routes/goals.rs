use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use pulse_core::analytics::{GoalQuery, GoalSessionsQuery};

use crate::{error::AppError, state::AppState};

/// `POST /api/sites/{site_id}/goals/{goal_id}/evaluate`
pub async fn evaluate_goal(
    State(state): State<Arc<AppState>>,
    Path((site_id, goal_id)): Path<(String, String)>,
    body: Result<Json<GoalQuery>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(query) = body?;
    let _slot = state.acquire_query_slot().await?;
    let stats = state
        .engine
        .evaluate_goal(&state.query_context(), &site_id, &goal_id, &query)
        .await?;
    Ok(Json(json!({ "data": stats })))
}

/// `POST /api/sites/{site_id}/goals/{goal_id}/sessions`
pub async fn goal_sessions(
    State(state): State<Arc<AppState>>,
    Path((site_id, goal_id)): Path<(String, String)>,
    body: Result<Json<GoalSessionsQuery>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(query) = body?;
    let _slot = state.acquire_query_slot().await?;
    let page = state
        .engine
        .list_goal_sessions(&state.query_context(), &site_id, &goal_id, &query)
        .await?;
    Ok(Json(json!({ "data": page })))
}
