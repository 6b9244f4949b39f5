//! Interfaces of the external collaborators: the raw event store and the
//! goal/site registry. Engines only ever see these traits.

use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

use crate::analytics::{FilterExpr, Goal, SiteConfig};
use crate::error::StoreError;
use crate::event::Event;

pub type EventStream<'a> = BoxStream<'a, Result<Event, StoreError>>;

/// One scan of a site's events in `[start, end)`.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub site_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub filters: Vec<FilterExpr>,
}

impl ScanRequest {
    pub fn new(site_id: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            site_id: site_id.into(),
            start,
            end,
            filters: Vec::new(),
        }
    }

    pub fn with_filters(mut self, filters: Vec<FilterExpr>) -> Self {
        self.filters = filters;
        self
    }

    /// Same request restricted to a sub-interval.
    pub fn narrowed(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            site_id: self.site_id.clone(),
            start,
            end,
            filters: self.filters.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistinctField {
    Session,
    Visitor,
}

impl DistinctField {
    pub fn column(&self) -> &'static str {
        match self {
            DistinctField::Session => "session_id",
            DistinctField::Visitor => "visitor_id",
        }
    }
}

#[async_trait::async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Lazily yields events ordered by `(session_id, timestamp, sequence_no)`.
    ///
    /// `request.filters` is a push-down hint: implementations may ignore any
    /// part of it, callers re-check every event they receive.
    async fn scan<'a>(&'a self, request: &ScanRequest) -> Result<EventStream<'a>, StoreError>;

    /// Distinct count of `field` over events matching `request` exactly.
    async fn count_distinct(
        &self,
        field: DistinctField,
        request: &ScanRequest,
    ) -> Result<u64, StoreError>;
}

#[async_trait::async_trait]
pub trait SiteRegistry: Send + Sync + 'static {
    async fn get_goal(&self, site_id: &str, goal_id: &str) -> Result<Option<Goal>, StoreError>;

    async fn get_site(&self, site_id: &str) -> Result<Option<SiteConfig>, StoreError>;
}
