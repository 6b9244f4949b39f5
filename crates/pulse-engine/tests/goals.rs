use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use pulse_core::analytics::{
    FunnelStep, Goal, GoalDefinition, GoalQuery, GoalSessionsQuery, GoalType, PageRequest,
    RangeSpec, SiteConfig, StepMatcher,
};
use pulse_core::config::EngineLimits;
use pulse_core::event::Event;
use pulse_engine::memory::{MemoryRegistry, MemoryStore};
use pulse_engine::{Engine, QueryContext};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()
}

fn event(session: &str, seq: u64, name: &str, url: Option<&str>) -> Event {
    Event {
        id: format!("{session}-{seq}"),
        site_id: "site_1".to_string(),
        session_id: session.to_string(),
        visitor_id: format!("visitor_{session}"),
        name: name.to_string(),
        timestamp: base() + Duration::minutes(seq as i64),
        sequence_no: seq,
        properties: Default::default(),
        page_url: url.map(str::to_string),
        referrer: None,
    }
}

fn range() -> RangeSpec {
    RangeSpec::Instants {
        start: base(),
        end: base() + Duration::days(1),
        timezone: None,
    }
}

fn signup_goal() -> Goal {
    Goal {
        id: "goal_signup".to_string(),
        site_id: "site_1".to_string(),
        name: "Signed up".to_string(),
        goal_type: GoalType::Event,
        definition: GoalDefinition::Predicate {
            matcher: StepMatcher::Event {
                name: "signup".to_string(),
            },
        },
    }
}

fn checkout_goal() -> Goal {
    Goal {
        id: "goal_checkout".to_string(),
        site_id: "site_1".to_string(),
        name: "Checkout".to_string(),
        goal_type: GoalType::Funnel,
        definition: GoalDefinition::Steps {
            steps: vec![FunnelStep::page("/cart"), FunnelStep::event("purchase")],
        },
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
    registry.put_goal(signup_goal()).await;
    registry.put_goal(checkout_goal()).await;
    Engine::new(
        Arc::new(MemoryStore::with_events(events)),
        Arc::new(registry),
        EngineLimits::default(),
    )
}

/// Ten sessions, three of which sign up.
fn ten_sessions() -> Vec<Event> {
    let mut events = Vec::new();
    for i in 0..10 {
        let session = format!("s{i}");
        events.push(event(&session, 0, "pageview", Some("/")));
        if i % 3 == 0 && i > 0 {
            events.push(event(&session, 1, "signup", None));
        }
    }
    events
}

fn goal_query() -> GoalQuery {
    GoalQuery {
        range: range(),
        filters: vec![],
    }
}

#[tokio::test]
async fn predicate_goal_conversion_rate() {
    let stats = engine(ten_sessions())
        .await
        .evaluate_goal(&QueryContext::new(), "site_1", "goal_signup", &goal_query())
        .await
        .expect("goal");
    assert_eq!(stats.conversions, 3);
    assert_eq!(stats.total_sessions, 10);
    assert_eq!(stats.conversion_rate, Some(0.3));
}

#[tokio::test]
async fn zero_sessions_have_null_rate() {
    let stats = engine(vec![])
        .await
        .evaluate_goal(&QueryContext::new(), "site_1", "goal_signup", &goal_query())
        .await
        .expect("goal");
    assert_eq!(stats.conversions, 0);
    assert_eq!(stats.conversion_rate, None);
}

#[tokio::test]
async fn funnel_goal_needs_every_step_in_order() {
    let events = vec![
        event("a", 0, "pageview", Some("/cart")),
        event("a", 1, "purchase", None),
        event("b", 0, "purchase", None),
        event("b", 1, "pageview", Some("/cart")),
        event("c", 0, "pageview", Some("/cart/")),
    ];
    let stats = engine(events)
        .await
        .evaluate_goal(&QueryContext::new(), "site_1", "goal_checkout", &goal_query())
        .await
        .expect("goal");
    assert_eq!(stats.conversions, 1);
    assert_eq!(stats.total_sessions, 3);
}

#[tokio::test]
async fn converting_sessions_are_paginated() {
    let page = engine(ten_sessions())
        .await
        .list_goal_sessions(
            &QueryContext::new(),
            "site_1",
            "goal_signup",
            &GoalSessionsQuery {
                range: range(),
                filters: vec![],
                page: PageRequest::page(1, 2),
            },
        )
        .await
        .expect("sessions");
    let ids: Vec<_> = page.items.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["s3", "s6"]);
    assert_eq!(page.total_count, 3);
    assert!(page.has_more);
    assert_eq!(page.items[0].event_count, 2);
    assert_eq!(page.items[0].duration_seconds, 60);
}

#[tokio::test]
async fn unknown_goal_is_not_found() {
    let err = engine(ten_sessions())
        .await
        .evaluate_goal(&QueryContext::new(), "site_1", "goal_missing", &goal_query())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
