use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{routes, state::AppState};

/// Construct the Axum [`Router`] with all routes and middleware attached.
///
/// Middleware is applied in outer-to-inner order (outermost runs first on
/// request, last on response):
///
/// 1. `TraceLayer`: structured request/response logging via `tracing`.
/// 2. `CorsLayer`: `PULSE_CORS_ORIGINS` when set, any origin otherwise.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origins(&state.config.cors_origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health))
        .route(
            "/api/sites/{site_id}/aggregate",
            post(routes::aggregate::aggregate),
        )
        .route(
            "/api/sites/{site_id}/funnels/evaluate",
            post(routes::funnels::evaluate_funnel),
        )
        .route(
            "/api/sites/{site_id}/funnels/sessions",
            post(routes::funnels::step_sessions),
        )
        .route(
            "/api/sites/{site_id}/journeys",
            post(routes::journeys::build_journeys),
        )
        .route(
            "/api/sites/{site_id}/goals/{goal_id}/evaluate",
            post(routes::goals::evaluate_goal),
        )
        .route(
            "/api/sites/{site_id}/goals/{goal_id}/sessions",
            post(routes::goals::goal_sessions),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn allowed_origins(origins: &[String]) -> AllowOrigin {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if parsed.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(parsed)
    }
}
