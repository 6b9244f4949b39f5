use std::collections::{HashSet, VecDeque};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::DateTime;
use duckdb::Connection;
use futures_util::{stream, StreamExt};

use pulse_core::error::StoreError;
use pulse_core::event::Event;
use pulse_core::store::{DistinctField, EventStore, EventStream, ScanRequest};
use pulse_engine::filter;

use crate::backend::DuckDbBackend;
use crate::pushdown::PushDown;

/// Rows fetched per lock acquisition while streaming a scan.
pub const SCAN_BATCH_SIZE: usize = 2_048;

const EVENT_COLUMNS: &str = "e.id, e.site_id, e.session_id, e.visitor_id, e.name, \
     e.ts_us, e.sequence_no, e.page_url, e.referrer, e.properties";

/// Position of the last row handed out, for keyset continuation.
#[derive(Debug, Clone)]
pub(crate) struct ScanKey {
    session_id: String,
    ts_us: i64,
    sequence_no: i64,
    id: String,
}

impl ScanKey {
    fn of(event: &Event) -> Result<Self> {
        Ok(Self {
            session_id: event.session_id.clone(),
            ts_us: event.timestamp.timestamp_micros(),
            sequence_no: i64::try_from(event.sequence_no)?,
            id: event.id.clone(),
        })
    }
}

struct RawEvent {
    id: String,
    site_id: String,
    session_id: String,
    visitor_id: String,
    name: String,
    ts_us: i64,
    sequence_no: i64,
    page_url: Option<String>,
    referrer: Option<String>,
    properties: String,
}

impl RawEvent {
    fn into_event(self) -> Result<Event> {
        let timestamp = DateTime::from_timestamp_micros(self.ts_us)
            .ok_or_else(|| anyhow!("event {} has out-of-range ts_us {}", self.id, self.ts_us))?;
        Ok(Event {
            properties: serde_json::from_str(&self.properties)?,
            sequence_no: u64::try_from(self.sequence_no)?,
            id: self.id,
            site_id: self.site_id,
            session_id: self.session_id,
            visitor_id: self.visitor_id,
            name: self.name,
            timestamp,
            page_url: self.page_url,
            referrer: self.referrer,
        })
    }
}

/// Shared `FROM ... WHERE` clause of scans and counts.
fn base_where(
    request: &ScanRequest,
    pushdown: &PushDown,
    params: &mut Vec<Box<dyn duckdb::types::ToSql>>,
    param_idx: &mut usize,
) -> String {
    let mut sql = format!(
        "FROM events e WHERE e.site_id = ?{} AND e.ts_us >= ?{} AND e.ts_us < ?{}",
        *param_idx,
        *param_idx + 1,
        *param_idx + 2
    );
    params.push(Box::new(request.site_id.clone()));
    params.push(Box::new(request.start.timestamp_micros()));
    params.push(Box::new(request.end.timestamp_micros()));
    *param_idx += 3;
    pushdown.append_event_filters(&mut sql, params, param_idx);
    sql
}

/// One ordered page of a scan, strictly after `after` when given.
pub(crate) fn scan_batch_inner(
    conn: &Connection,
    request: &ScanRequest,
    pushdown: &PushDown,
    after: Option<&ScanKey>,
    limit: usize,
) -> Result<Vec<Event>> {
    let mut params: Vec<Box<dyn duckdb::types::ToSql>> = Vec::new();
    let mut param_idx = 1;
    let mut sql = format!(
        "SELECT {EVENT_COLUMNS} {}",
        base_where(request, pushdown, &mut params, &mut param_idx)
    );

    if let Some(key) = after {
        let i = param_idx;
        sql.push_str(&format!(
            " AND (e.session_id > ?{i} OR (e.session_id = ?{} AND (e.ts_us > ?{} OR (e.ts_us = ?{} \
             AND (e.sequence_no > ?{} OR (e.sequence_no = ?{} AND e.id > ?{}))))))",
            i + 1,
            i + 2,
            i + 3,
            i + 4,
            i + 5,
            i + 6
        ));
        params.push(Box::new(key.session_id.clone()));
        params.push(Box::new(key.session_id.clone()));
        params.push(Box::new(key.ts_us));
        params.push(Box::new(key.ts_us));
        params.push(Box::new(key.sequence_no));
        params.push(Box::new(key.sequence_no));
        params.push(Box::new(key.id.clone()));
        param_idx += 7;
    }
    sql.push_str(&format!(
        " ORDER BY e.session_id, e.ts_us, e.sequence_no, e.id LIMIT ?{param_idx}"
    ));
    params.push(Box::new(i64::try_from(limit)?));

    let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        Ok(RawEvent {
            id: row.get(0)?,
            site_id: row.get(1)?,
            session_id: row.get(2)?,
            visitor_id: row.get(3)?,
            name: row.get(4)?,
            ts_us: row.get(5)?,
            sequence_no: row.get(6)?,
            page_url: row.get(7)?,
            referrer: row.get(8)?,
            properties: row.get(9)?,
        })
    })?;

    let mut events = Vec::with_capacity(limit);
    for raw in rows {
        events.push(raw?.into_event()?);
    }
    Ok(events)
}

/// `COUNT(DISTINCT column)` when every filter pushes down.
fn count_distinct_inner(
    conn: &Connection,
    field: DistinctField,
    request: &ScanRequest,
    pushdown: &PushDown,
) -> Result<u64> {
    let mut params: Vec<Box<dyn duckdb::types::ToSql>> = Vec::new();
    let mut param_idx = 1;
    let sql = format!(
        "SELECT COUNT(DISTINCT e.{}) {}",
        field.column(),
        base_where(request, pushdown, &mut params, &mut param_idx)
    );
    let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let count: i64 = conn
        .prepare(&sql)?
        .query_row(param_refs.as_slice(), |row| row.get(0))?;
    Ok(u64::try_from(count)?)
}

struct ScanState {
    request: ScanRequest,
    pushdown: PushDown,
    after: Option<ScanKey>,
    buffer: VecDeque<Event>,
    exhausted: bool,
}

impl DuckDbBackend {
    async fn scan_batch(&self, state: &ScanState) -> Result<Vec<Event>, StoreError> {
        let conn = self.lock().await?;
        scan_batch_inner(
            &conn,
            &state.request,
            &state.pushdown,
            state.after.as_ref(),
            SCAN_BATCH_SIZE,
        )
        .map_err(StoreError::Query)
    }

    async fn fill(&self, state: &mut ScanState) -> Result<(), StoreError> {
        let batch = self.scan_batch(state).await?;
        state.exhausted = batch.len() < SCAN_BATCH_SIZE;
        if let Some(last) = batch.last() {
            state.after = Some(ScanKey::of(last)?);
        }
        state.buffer.extend(batch);
        Ok(())
    }

    async fn next_event(
        &self,
        mut state: ScanState,
    ) -> Result<Option<(Event, ScanState)>, StoreError> {
        loop {
            if let Some(event) = state.buffer.pop_front() {
                return Ok(Some((event, state)));
            }
            if state.exhausted {
                return Ok(None);
            }
            self.fill(&mut state).await?;
        }
    }
}

#[async_trait]
impl EventStore for DuckDbBackend {
    /// Streams matching events in `(session_id, ts, sequence_no)` order,
    /// fetching [`SCAN_BATCH_SIZE`] rows per lock acquisition.
    async fn scan<'a>(&'a self, request: &ScanRequest) -> Result<EventStream<'a>, StoreError> {
        let mut state = ScanState {
            pushdown: PushDown::split(&request.filters),
            request: request.clone(),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };
        // The first batch runs eagerly so connection failures surface here.
        self.fill(&mut state).await?;
        Ok(stream::try_unfold(state, move |state| self.next_event(state)).boxed())
    }

    async fn count_distinct(
        &self,
        field: DistinctField,
        request: &ScanRequest,
    ) -> Result<u64, StoreError> {
        let pushdown = PushDown::split(&request.filters);
        if pushdown.is_exact() {
            let conn = self.lock().await?;
            return count_distinct_inner(&conn, field, request, &pushdown)
                .map_err(StoreError::Query);
        }

        // Residual filters: stream the pushed-down rows and test the rest here.
        let residual = filter::compile(&pushdown.residual)
            .map_err(|e| StoreError::Query(anyhow!(e.to_string())))?;
        let mut distinct = HashSet::new();
        let mut events = self.scan(request).await?;
        while let Some(event) = events.next().await {
            let event = event?;
            if residual.test(&event) {
                distinct.insert(match field {
                    DistinctField::Session => event.session_id,
                    DistinctField::Visitor => event.visitor_id,
                });
            }
        }
        Ok(distinct.len() as u64)
    }
}
