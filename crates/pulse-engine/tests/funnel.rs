use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use pulse_core::analytics::{
    Filter, FilterOperator, FunnelQuery, FunnelStep, PageRequest, RangeSpec, SiteConfig,
    StepMode, StepSessionsQuery,
};
use pulse_core::config::EngineLimits;
use pulse_core::event::Event;
use pulse_engine::memory::{MemoryRegistry, MemoryStore};
use pulse_engine::{Engine, QueryContext};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
}

fn event(session: &str, offset_s: i64, seq: u64, name: &str, url: Option<&str>) -> Event {
    Event {
        id: format!("{session}-{seq}"),
        site_id: "site_1".to_string(),
        session_id: session.to_string(),
        visitor_id: format!("visitor_{session}"),
        name: name.to_string(),
        timestamp: base() + Duration::seconds(offset_s),
        sequence_no: seq,
        properties: Default::default(),
        page_url: url.map(str::to_string),
        referrer: None,
    }
}

fn range() -> RangeSpec {
    RangeSpec::Instants {
        start: base() - Duration::hours(1),
        end: base() + Duration::days(1),
        timezone: None,
    }
}

async fn engine(events: Vec<Event>) -> Engine {
    let registry = MemoryRegistry::new();
    registry
        .put_site(SiteConfig {
            id: "site_1".to_string(),
            name: "Example".to_string(),
            timezone: "UTC".to_string(),
            public: false,
        })
        .await;
    Engine::new(
        Arc::new(MemoryStore::with_events(events)),
        Arc::new(registry),
        EngineLimits::default(),
    )
}

fn steps() -> Vec<FunnelStep> {
    vec![
        FunnelStep::page("/"),
        FunnelStep::page("/pricing"),
        FunnelStep::event("signup"),
    ]
}

/// 5 sessions never enter, 15 stop at step 1, 15 at step 2, 10 convert.
fn scenario_events() -> Vec<Event> {
    let mut events = Vec::new();
    for i in 0..45 {
        let session = format!("s{i:02}");
        if i < 5 {
            events.push(event(&session, 0, 0, "pageview", Some("/blog")));
            continue;
        }
        events.push(event(&session, 0, 0, "pageview", Some("/")));
        if i >= 20 {
            events.push(event(&session, 30, 1, "pageview", Some("/pricing")));
        }
        if i >= 35 {
            events.push(event(&session, 90, 2, "signup", None));
        }
    }
    events
}

#[tokio::test]
async fn three_step_funnel_reached_and_dropped() {
    let engine = engine(scenario_events()).await;
    let result = engine
        .evaluate_funnel(
            &QueryContext::new(),
            "site_1",
            &FunnelQuery {
                range: range(),
                steps: steps(),
                filters: vec![],
            },
        )
        .await
        .expect("funnel");

    assert_eq!(result.reached(), vec![40, 25, 10]);
    assert_eq!(result.dropped(), vec![15, 15, 10]);
    assert_eq!(result.total_sessions_entered, 40);
    for pair in result.steps.windows(2) {
        assert!(pair[0].reached >= pair[1].reached);
        assert_eq!(pair[0].reached, pair[1].reached + pair[0].dropped);
    }
}

#[tokio::test]
async fn out_of_order_satisfaction_never_counts() {
    let events = vec![
        event("a", 0, 0, "signup", None),
        event("a", 10, 1, "pageview", Some("/pricing")),
        event("a", 20, 2, "pageview", Some("/")),
    ];
    let engine = engine(events).await;
    let result = engine
        .evaluate_funnel(
            &QueryContext::new(),
            "site_1",
            &FunnelQuery {
                range: range(),
                steps: steps(),
                filters: vec![],
            },
        )
        .await
        .expect("funnel");
    assert_eq!(result.reached(), vec![1, 0, 0]);
}

#[tokio::test]
async fn global_filters_hide_events_from_the_walk() {
    let mut events = scenario_events();
    for e in events.iter_mut().filter(|e| e.session_id == "s40") {
        e.properties.insert("country".to_string(), "PL".into());
    }
    let engine = engine(events).await;
    let result = engine
        .evaluate_funnel(
            &QueryContext::new(),
            "site_1",
            &FunnelQuery {
                range: range(),
                steps: steps(),
                filters: vec![Filter::new("country", FilterOperator::Eq, "PL").into()],
            },
        )
        .await
        .expect("funnel");
    assert_eq!(result.reached(), vec![1, 1, 1]);
}

#[tokio::test]
async fn single_step_funnel_is_rejected_before_scanning() {
    let store = MemoryStore::new();
    store.fail_next_calls(100);
    let registry = MemoryRegistry::new();
    let engine = Engine::new(Arc::new(store), Arc::new(registry), EngineLimits::default());
    let err = engine
        .evaluate_funnel(
            &QueryContext::new(),
            "site_1",
            &FunnelQuery {
                range: range(),
                steps: vec![FunnelStep::page("/")],
                filters: vec![],
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_funnel");
}

#[tokio::test]
async fn step_sessions_paginate_dropped_sessions() {
    let engine = engine(scenario_events()).await;
    let query = |page: PageRequest| StepSessionsQuery {
        range: range(),
        steps: steps(),
        filters: vec![],
        step: 2,
        mode: StepMode::Dropped,
        page,
    };

    let first = engine
        .list_step_sessions(&QueryContext::new(), "site_1", &query(PageRequest::page(1, 10)))
        .await
        .expect("first page");
    assert_eq!(first.total_count, 15);
    assert_eq!(first.items.len(), 10);
    assert!(first.has_more);
    assert!(first.items.iter().all(|s| s.reached_steps == Some(2)));
    assert_eq!(first.items[0].session_id, "s20");
    assert_eq!(first.items[0].entry_page.as_deref(), Some("/"));
    assert_eq!(first.items[0].exit_page.as_deref(), Some("/pricing"));

    let cursor = first.next_cursor.clone().expect("cursor");
    let second = engine
        .list_step_sessions(&QueryContext::new(), "site_1", &query(PageRequest::cursor(cursor, 10)))
        .await
        .expect("second page");
    assert_eq!(second.items.len(), 5);
    assert!(!second.has_more);
    assert_eq!(second.items[0].session_id, "s30");

    let reached = engine
        .list_step_sessions(
            &QueryContext::new(),
            "site_1",
            &StepSessionsQuery {
                mode: StepMode::Reached,
                ..query(PageRequest::page(1, 50))
            },
        )
        .await
        .expect("reached");
    assert_eq!(reached.total_count, 25);
}

#[tokio::test]
async fn step_number_out_of_range_is_invalid() {
    let engine = engine(scenario_events()).await;
    let err = engine
        .list_step_sessions(
            &QueryContext::new(),
            "site_1",
            &StepSessionsQuery {
                range: range(),
                steps: steps(),
                filters: vec![],
                step: 4,
                mode: StepMode::Reached,
                page: PageRequest::default(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_funnel");
}

#[tokio::test]
async fn unknown_site_is_not_found() {
    let engine = engine(vec![]).await;
    let err = engine
        .evaluate_funnel(
            &QueryContext::new(),
            "site_missing",
            &FunnelQuery {
                range: range(),
                steps: steps(),
                filters: vec![],
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
