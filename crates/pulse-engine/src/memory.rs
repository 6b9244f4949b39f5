//! Process-local [`EventStore`] and [`SiteRegistry`] implementations.
//!
//! Used by the `memory` store mode and throughout the test suites.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{stream, StreamExt};
use tokio::sync::RwLock;

use pulse_core::analytics::{Goal, SiteConfig};
use pulse_core::error::StoreError;
use pulse_core::event::Event;
use pulse_core::store::{DistinctField, EventStore, EventStream, ScanRequest, SiteRegistry};

use crate::filter;

#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<Event>>,
    failing_calls: AtomicU32,
    scan_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Vec<Event>) -> Self {
        let mut sorted = events;
        sort_events(&mut sorted);
        Self {
            events: RwLock::new(sorted),
            ..Self::default()
        }
    }

    /// Delays every yielded event, to make scans observable mid-flight.
    pub fn with_scan_delay(mut self, delay: Duration) -> Self {
        self.scan_delay = Some(delay);
        self
    }

    pub async fn insert_events(&self, events: &[Event]) {
        let mut stored = self.events.write().await;
        stored.extend_from_slice(events);
        sort_events(&mut stored);
    }

    /// The next `calls` store calls fail with `StoreError::Unavailable`.
    pub fn fail_next_calls(&self, calls: u32) {
        self.failing_calls.store(calls, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        let remaining = self.failing_calls.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failing_calls
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    async fn in_range(&self, request: &ScanRequest) -> Vec<Event> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| {
                e.site_id == request.site_id
                    && e.timestamp >= request.start
                    && e.timestamp < request.end
            })
            .cloned()
            .collect()
    }
}

fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
}

#[async_trait::async_trait]
impl EventStore for MemoryStore {
    /// Ignores the push-down hint; the engine filters every event itself.
    async fn scan<'a>(&'a self, request: &ScanRequest) -> Result<EventStream<'a>, StoreError> {
        self.injected_failure()?;
        let events = self.in_range(request).await;
        let items = stream::iter(events.into_iter().map(Ok));
        Ok(match self.scan_delay {
            Some(delay) => items
                .then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })
                .boxed(),
            None => items.boxed(),
        })
    }

    async fn count_distinct(
        &self,
        field: DistinctField,
        request: &ScanRequest,
    ) -> Result<u64, StoreError> {
        self.injected_failure()?;
        let predicate = filter::compile(&request.filters)
            .map_err(|e| StoreError::Query(anyhow::anyhow!(e.to_string())))?;
        let events = self.in_range(request).await;
        let distinct: HashSet<&str> = events
            .iter()
            .filter(|e| predicate.test(e))
            .map(|e| match field {
                DistinctField::Session => e.session_id.as_str(),
                DistinctField::Visitor => e.visitor_id.as_str(),
            })
            .collect();
        Ok(distinct.len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    sites: RwLock<HashMap<String, SiteConfig>>,
    goals: RwLock<HashMap<(String, String), Goal>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_site(&self, site: SiteConfig) {
        self.sites.write().await.insert(site.id.clone(), site);
    }

    pub async fn put_goal(&self, goal: Goal) {
        self.goals
            .write()
            .await
            .insert((goal.site_id.clone(), goal.id.clone()), goal);
    }
}

#[async_trait::async_trait]
impl SiteRegistry for MemoryRegistry {
    async fn get_goal(&self, site_id: &str, goal_id: &str) -> Result<Option<Goal>, StoreError> {
        Ok(self
            .goals
            .read()
            .await
            .get(&(site_id.to_string(), goal_id.to_string()))
            .cloned())
    }

    async fn get_site(&self, site_id: &str) -> Result<Option<SiteConfig>, StoreError> {
        Ok(self.sites.read().await.get(site_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use futures_util::TryStreamExt;

    use pulse_core::analytics::{Filter, FilterOperator};

    use super::*;

    fn event(session: &str, visitor: &str, minute: i64, name: &str) -> Event {
        Event {
            id: format!("{session}-{minute}"),
            site_id: "site_1".to_string(),
            session_id: session.to_string(),
            visitor_id: visitor.to_string(),
            name: name.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
                + ChronoDuration::minutes(minute),
            sequence_no: 0,
            properties: Default::default(),
            page_url: Some("/".to_string()),
            referrer: None,
        }
    }

    fn request() -> ScanRequest {
        ScanRequest::new(
            "site_1",
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn scan_orders_by_session_then_time() {
        let store = MemoryStore::with_events(vec![
            event("b", "v1", 5, "pageview"),
            event("a", "v1", 9, "pageview"),
            event("a", "v1", 1, "pageview"),
        ]);
        let events: Vec<Event> = store.scan(&request()).await.unwrap().try_collect().await.unwrap();
        let keys: Vec<_> = events.iter().map(|e| (e.session_id.as_str(), e.id.as_str())).collect();
        assert_eq!(keys, vec![("a", "a-1"), ("a", "a-9"), ("b", "b-5")]);
    }

    #[tokio::test]
    async fn count_distinct_applies_filters() {
        let store = MemoryStore::with_events(vec![
            event("a", "v1", 1, "pageview"),
            event("b", "v1", 2, "signup"),
            event("c", "v2", 3, "pageview"),
        ]);
        let all = store.count_distinct(DistinctField::Session, &request()).await.unwrap();
        assert_eq!(all, 3);
        let filtered = request().with_filters(vec![Filter::new("name", FilterOperator::Eq, "pageview").into()]);
        assert_eq!(store.count_distinct(DistinctField::Session, &filtered).await.unwrap(), 2);
        assert_eq!(store.count_distinct(DistinctField::Visitor, &request()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_counted() {
        let store = MemoryStore::new();
        store.fail_next_calls(1);
        let err = store.count_distinct(DistinctField::Session, &request()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.count_distinct(DistinctField::Session, &request()).await.is_ok());
    }
}
