use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use pulse_core::analytics::AggregateQuery;

use crate::{error::AppError, state::AppState};

/// `POST /api/sites/{site_id}/aggregate`: bucketed metric series with
/// totals and an optional group-by breakdown.
pub async fn aggregate(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    body: Result<Json<AggregateQuery>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(query) = body?;
    let _slot = state.acquire_query_slot().await?;
    let result = state
        .engine
        .aggregate(&state.query_context(), &site_id, &query)
        .await?;
    Ok(Json(json!({ "data": result })))
}
