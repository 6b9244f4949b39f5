//! Session stitching over ordered scan streams.
//!
//! Stores yield events ordered by `(session_id, timestamp, sequence_no)`, so
//! a session is a contiguous run and can be folded one at a time without
//! holding the whole range in memory.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;

use pulse_core::analytics::SessionListItem;
use pulse_core::config::EngineLimits;
use pulse_core::error::EngineError;
use pulse_core::event::Event;
use pulse_core::store::{EventStore, EventStream, ScanRequest};

use crate::context::QueryContext;
use crate::filter::Predicate;
use crate::paths::pageview_path;
use crate::retry::Backoff;

/// The visible events of one session, in order. Never empty.
#[derive(Debug, Clone)]
pub struct SessionRun {
    pub session_id: String,
    pub events: Vec<Event>,
}

impl SessionRun {
    pub fn visitor_id(&self) -> &str {
        self.events
            .first()
            .map(|e| e.visitor_id.as_str())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary::of(&self.events)
    }
}

/// Derived per-session figures shared by metrics and session listings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub event_count: u64,
    pub pageview_count: u64,
    pub entry_page: Option<String>,
    pub exit_page: Option<String>,
}

impl SessionSummary {
    /// Summarizes a non-empty, ordered run. An empty slice yields the epoch.
    pub fn of(events: &[Event]) -> Self {
        let first_seen = events.first().map(|e| e.timestamp).unwrap_or_default();
        let last_seen = events.last().map(|e| e.timestamp).unwrap_or_default();
        let mut pages = events.iter().filter_map(pageview_path);
        let entry_page = pages.next();
        let exit_page = pages.last().or_else(|| entry_page.clone());
        Self {
            first_seen,
            last_seen,
            event_count: events.len() as u64,
            pageview_count: events.iter().filter(|e| e.is_pageview()).count() as u64,
            entry_page,
            exit_page,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.last_seen - self.first_seen).num_milliseconds() as f64 / 1000.0
    }

    pub fn is_bounce(&self) -> bool {
        self.pageview_count == 1
    }

    pub fn list_item(&self, run: &SessionRun, reached_steps: Option<u32>) -> SessionListItem {
        SessionListItem {
            session_id: run.session_id.clone(),
            visitor_id: run.visitor_id().to_string(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            duration_seconds: (self.last_seen - self.first_seen).num_seconds(),
            event_count: self.event_count,
            pageview_count: self.pageview_count,
            entry_page: self.entry_page.clone(),
            exit_page: self.exit_page.clone(),
            reached_steps,
        }
    }
}

/// Groups an ordered event stream into session runs, dropping events the
/// predicate rejects and sessions left with no events.
pub struct SessionStitcher<'a> {
    events: EventStream<'a>,
    predicate: &'a Predicate,
    ctx: &'a QueryContext,
    pending: Option<Event>,
    last_key: Option<(String, DateTime<Utc>, u64)>,
}

impl<'a> SessionStitcher<'a> {
    pub fn new(events: EventStream<'a>, predicate: &'a Predicate, ctx: &'a QueryContext) -> Self {
        Self {
            events,
            predicate,
            ctx,
            pending: None,
            last_key: None,
        }
    }

    pub async fn next_session(&mut self) -> Result<Option<SessionRun>, EngineError> {
        let mut current: Option<SessionRun> = None;
        loop {
            self.ctx.check()?;
            let event = match self.pending.take() {
                Some(event) => event,
                None => match self.events.next().await {
                    Some(item) => {
                        let event = item?;
                        self.check_order(&event)?;
                        if !self.predicate.evaluate(&event)? {
                            continue;
                        }
                        event
                    }
                    None => return Ok(current),
                },
            };

            match current.as_mut() {
                None => {
                    current = Some(SessionRun {
                        session_id: event.session_id.clone(),
                        events: vec![event],
                    });
                }
                Some(run) if run.session_id == event.session_id => run.events.push(event),
                Some(_) => {
                    self.pending = Some(event);
                    return Ok(current);
                }
            }
        }
    }

    fn check_order(&mut self, event: &Event) -> Result<(), EngineError> {
        let key = (
            event.session_id.clone(),
            event.timestamp,
            event.sequence_no,
        );
        if let Some(last) = &self.last_key {
            if key <= *last {
                return Err(EngineError::Internal(anyhow::anyhow!(
                    "store returned events out of order at session {}",
                    event.session_id
                )));
            }
        }
        self.last_key = Some(key);
        Ok(())
    }
}

/// What a scan needs besides its request: the store, the query context and
/// the engine limits.
#[derive(Clone, Copy)]
pub struct ScanScope<'a> {
    pub store: &'a dyn EventStore,
    pub ctx: &'a QueryContext,
    pub limits: &'a EngineLimits,
}

/// Folds every session of `request` into a state built by `init`.
///
/// A transient storage failure restarts the whole pass from a fresh state,
/// so `visit` never sees a session twice within the returned result.
pub async fn fold_sessions<S, I, F>(
    scope: ScanScope<'_>,
    request: &ScanRequest,
    predicate: &Predicate,
    init: I,
    mut visit: F,
) -> Result<S, EngineError>
where
    I: Fn() -> S,
    F: FnMut(&mut S, SessionRun) -> Result<(), EngineError>,
{
    let mut backoff = Backoff::new(scope.ctx, scope.limits, "scan");
    loop {
        let mut state = init();
        match fold_once(scope, request, predicate, &mut state, &mut visit).await {
            Ok(()) => return Ok(state),
            Err(err) => backoff.retry_after(err).await?,
        }
    }
}

async fn fold_once<S, F>(
    scope: ScanScope<'_>,
    request: &ScanRequest,
    predicate: &Predicate,
    state: &mut S,
    visit: &mut F,
) -> Result<(), EngineError>
where
    F: FnMut(&mut S, SessionRun) -> Result<(), EngineError>,
{
    let events = scope.store.scan(request).await?;
    let mut stitcher = SessionStitcher::new(events, predicate, scope.ctx);
    while let Some(run) = stitcher.next_session().await? {
        visit(state, run)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use futures_util::stream;

    use pulse_core::analytics::{Filter, FilterOperator};
    use pulse_core::error::StoreError;

    use super::*;
    use crate::filter::compile;

    fn event(session: &str, seq: u64, name: &str, url: Option<&str>) -> Event {
        Event {
            id: format!("{session}-{seq}"),
            site_id: "site_1".to_string(),
            session_id: session.to_string(),
            visitor_id: format!("v-{session}"),
            name: name.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
                + Duration::seconds(seq as i64 * 30),
            sequence_no: seq,
            properties: Default::default(),
            page_url: url.map(str::to_string),
            referrer: None,
        }
    }

    fn stream_of(events: Vec<Event>) -> EventStream<'static> {
        stream::iter(events.into_iter().map(Ok::<_, StoreError>)).boxed()
    }

    async fn collect(stitcher: &mut SessionStitcher<'_>) -> Vec<SessionRun> {
        let mut runs = Vec::new();
        while let Some(run) = stitcher.next_session().await.unwrap() {
            runs.push(run);
        }
        runs
    }

    #[tokio::test]
    async fn groups_contiguous_sessions() {
        let events = vec![
            event("a", 0, "pageview", Some("/")),
            event("a", 1, "pageview", Some("/pricing")),
            event("b", 0, "signup", None),
        ];
        let predicate = Predicate::always();
        let ctx = QueryContext::new();
        let mut stitcher = SessionStitcher::new(stream_of(events), &predicate, &ctx);
        let runs = collect(&mut stitcher).await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].events.len(), 2);
        assert_eq!(runs[1].session_id, "b");
    }

    #[tokio::test]
    async fn sessions_without_visible_events_are_skipped() {
        let events = vec![
            event("a", 0, "pageview", Some("/")),
            event("b", 0, "signup", None),
            event("c", 0, "pageview", Some("/blog")),
        ];
        let predicate = compile(&[Filter::new("name", FilterOperator::Eq, "pageview").into()]).unwrap();
        let ctx = QueryContext::new();
        let mut stitcher = SessionStitcher::new(stream_of(events), &predicate, &ctx);
        let ids: Vec<_> = collect(&mut stitcher).await.into_iter().map(|r| r.session_id).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn out_of_order_stream_is_an_internal_error() {
        let events = vec![event("b", 0, "pageview", Some("/")), event("a", 0, "pageview", Some("/"))];
        let predicate = Predicate::always();
        let ctx = QueryContext::new();
        let mut stitcher = SessionStitcher::new(stream_of(events), &predicate, &ctx);
        let first = stitcher.next_session().await;
        assert_eq!(first.unwrap_err().kind(), "internal_error");
    }

    #[tokio::test]
    async fn cancelled_context_stops_stitching() {
        let events = vec![event("a", 0, "pageview", Some("/"))];
        let predicate = Predicate::always();
        let ctx = QueryContext::new();
        ctx.cancel();
        let mut stitcher = SessionStitcher::new(stream_of(events), &predicate, &ctx);
        assert!(matches!(stitcher.next_session().await, Err(EngineError::Cancelled)));
    }

    #[test]
    fn summary_tracks_entry_exit_and_bounce() {
        let events = vec![
            event("a", 0, "pageview", Some("https://example.com/Landing/")),
            event("a", 1, "cta_click", None),
            event("a", 2, "pageview", Some("/pricing?x=1")),
        ];
        let summary = SessionSummary::of(&events);
        assert_eq!(summary.entry_page.as_deref(), Some("/landing"));
        assert_eq!(summary.exit_page.as_deref(), Some("/pricing"));
        assert_eq!(summary.pageview_count, 2);
        assert_eq!(summary.event_count, 3);
        assert_eq!(summary.duration_seconds(), 60.0);
        assert!(!summary.is_bounce());

        let single = SessionSummary::of(&events[..1]);
        assert_eq!(single.exit_page.as_deref(), Some("/landing"));
        assert!(single.is_bounce());
    }
}
