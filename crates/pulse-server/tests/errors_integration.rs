use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use pulse_core::analytics::SiteConfig;
use pulse_core::config::{Config, StoreMode};
use pulse_core::event::Event;
use pulse_engine::memory::{MemoryRegistry, MemoryStore};
use pulse_server::app::build_app;
use pulse_server::state::AppState;

fn config() -> Config {
    Config {
        port: 0,
        data_dir: "/tmp/pulse-test".to_string(),
        duckdb_memory_limit: "1GB".to_string(),
        store: StoreMode::Memory,
        cors_origins: vec![],
        max_buckets: 1000,
        group_top_k: 10,
        scan_concurrency: 4,
        query_concurrency: 4,
        query_timeout_ms: 10_000,
        storage_retries: 1,
        retry_base_ms: 1,
        seed_path: None,
    }
}

fn events(sessions: usize) -> Vec<Event> {
    let base = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
    (0..sessions)
        .map(|i| Event {
            id: format!("e{i}"),
            site_id: "site_1".to_string(),
            session_id: format!("s{i:03}"),
            visitor_id: format!("v{i}"),
            name: "pageview".to_string(),
            timestamp: base + Duration::seconds(i as i64),
            sequence_no: 0,
            properties: Default::default(),
            page_url: Some("/".to_string()),
            referrer: None,
        })
        .collect()
}

async fn state_with(store: MemoryStore, config: Config) -> (Arc<AppState>, Arc<MemoryStore>) {
    let store = Arc::new(store);
    let registry = Arc::new(MemoryRegistry::new());
    registry
        .put_site(SiteConfig {
            id: "site_1".to_string(),
            name: "Example".to_string(),
            timezone: "UTC".to_string(),
            public: false,
        })
        .await;
    let state = Arc::new(AppState::in_memory(store.clone(), registry, config));
    (state, store)
}

fn funnel_body() -> Value {
    json!({
        "range": {
            "type": "instants",
            "start": "2026-05-01T00:00:00Z",
            "end": "2026-05-02T00:00:00Z"
        },
        "steps": [
            {"type": "page", "path": "/"},
            {"type": "page", "path": "/pricing"}
        ]
    })
}

async fn post(app: axum::Router, uri: &str, body: String) -> (StatusCode, Option<String>, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("build request");
    let response = app.oneshot(request).await.expect("request");
    let status = response.status();
    let retry_after = response
        .headers()
        .get("retry-after")
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (
        status,
        retry_after,
        serde_json::from_slice(&bytes).expect("parse JSON"),
    )
}

#[tokio::test]
async fn test_unknown_site_is_404() {
    let (state, _) = state_with(MemoryStore::new(), config()).await;
    let (status, _, json) = post(
        build_app(state),
        "/api/sites/site_missing/funnels/evaluate",
        funnel_body().to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_unknown_goal_is_404() {
    let (state, _) = state_with(MemoryStore::new(), config()).await;
    let (status, _, json) = post(
        build_app(state),
        "/api/sites/site_1/goals/goal_missing/evaluate",
        funnel_body().to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_validation_errors_are_400_with_kind() {
    let (state, _) = state_with(MemoryStore::with_events(events(3)), config()).await;
    let app = build_app(state);

    let mut single_step = funnel_body();
    single_step["steps"] = json!([{"type": "page", "path": "/"}]);
    let (status, _, json) = post(
        app.clone(),
        "/api/sites/site_1/funnels/evaluate",
        single_step.to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "invalid_funnel");

    let mut mismatched = funnel_body();
    mismatched["filters"] = json!([{"parameter": "name", "operator": "eq", "value": 3}]);
    let (status, _, json) = post(
        app.clone(),
        "/api/sites/site_1/funnels/evaluate",
        mismatched.to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "type_mismatch");
    assert_eq!(json["error"]["field"], "name");

    let (status, _, json) = post(
        app,
        "/api/sites/site_1/funnels/evaluate",
        "{not json".to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_storage_outage_is_503_with_retry_after() {
    let (state, store) = state_with(MemoryStore::with_events(events(3)), config()).await;
    store.fail_next_calls(10);
    let (status, retry_after, json) = post(
        build_app(state),
        "/api/sites/site_1/funnels/evaluate",
        funnel_body().to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"]["code"], "storage_unavailable");
    assert_eq!(retry_after.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_query_timeout_is_408() {
    let slow = MemoryStore::with_events(events(200)).with_scan_delay(StdDuration::from_millis(5));
    let (state, _) = state_with(
        slow,
        Config {
            query_timeout_ms: 50,
            ..config()
        },
    )
    .await;
    let (status, _, json) = post(
        build_app(state),
        "/api/sites/site_1/funnels/evaluate",
        funnel_body().to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(json["error"]["code"], "cancelled");
}

#[tokio::test]
async fn test_full_query_queue_is_429() {
    let (state, _) = state_with(
        MemoryStore::with_events(events(3)),
        Config {
            query_concurrency: 1,
            query_timeout_ms: 50,
            ..config()
        },
    )
    .await;
    let _held = state.acquire_query_slot().await.expect("slot");
    let (status, _, json) = post(
        build_app(Arc::clone(&state)),
        "/api/sites/site_1/funnels/evaluate",
        funnel_body().to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["error"]["code"], "rate_limited");
}
