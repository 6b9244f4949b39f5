use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use pulse_core::analytics::JourneyQuery;

use crate::{error::AppError, state::AppState};

/// `POST /api/sites/{site_id}/journeys`: ranked session paths and their
/// prefix tree.
pub async fn build_journeys(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    body: Result<Json<JourneyQuery>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(query) = body?;
    let _slot = state.acquire_query_slot().await?;
    let result = state
        .engine
        .build_journeys(&state.query_context(), &site_id, &query)
        .await?;
    Ok(Json(json!({ "data": result })))
}
