//! Offset pagination with opaque cursor tokens.
//!
//! Offsets are best-effort: results may shift between calls when new events
//! arrive, there is no snapshot.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use pulse_core::analytics::{Page, PageRequest};
use pulse_core::error::EngineError;

pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    o: u64,
}

pub fn encode_cursor(offset: u64) -> String {
    // Serializing a single integer field cannot fail.
    let json = serde_json::to_vec(&CursorPayload { o: offset }).unwrap_or_default();
    STANDARD.encode(json)
}

pub fn decode_cursor(cursor: &str) -> Result<u64, EngineError> {
    let invalid = || EngineError::InvalidPagination("invalid cursor".to_string());
    let decoded = STANDARD.decode(cursor.trim()).map_err(|_| invalid())?;
    serde_json::from_slice::<CursorPayload>(&decoded)
        .map(|payload| payload.o)
        .map_err(|_| invalid())
}

/// The slice of a result list a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub offset: u64,
    pub limit: u32,
}

impl PageWindow {
    pub fn new(page_number: u32, page_size: u32) -> Result<Self, EngineError> {
        if page_number < 1 {
            return Err(EngineError::InvalidPagination(
                "page must be at least 1".to_string(),
            ));
        }
        let limit = checked_limit(page_size)?;
        Ok(Self {
            offset: u64::from(page_number - 1) * u64::from(limit),
            limit,
        })
    }

    pub fn from_request(request: &PageRequest) -> Result<Self, EngineError> {
        match &request.cursor {
            Some(cursor) => Ok(Self {
                offset: decode_cursor(cursor)?,
                limit: checked_limit(request.limit)?,
            }),
            None => Self::new(request.page.unwrap_or(1), request.limit),
        }
    }

    fn contains(&self, index: u64) -> bool {
        index >= self.offset && index < self.offset + u64::from(self.limit)
    }

    fn finish<T>(&self, items: Vec<T>, total_count: u64) -> Page<T> {
        let next_offset = self.offset + items.len() as u64;
        let has_more = next_offset < total_count;
        let page = u32::try_from(self.offset / u64::from(self.limit))
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        Page {
            items,
            total_count,
            page,
            limit: self.limit,
            has_more,
            next_cursor: has_more.then(|| encode_cursor(next_offset)),
        }
    }
}

fn checked_limit(page_size: u32) -> Result<u32, EngineError> {
    if page_size < 1 {
        return Err(EngineError::InvalidPagination(
            "limit must be at least 1".to_string(),
        ));
    }
    Ok(page_size.min(MAX_PAGE_SIZE))
}

/// Slices an already materialized list.
pub fn page<T: Clone>(items: &[T], page_number: u32, page_size: u32) -> Result<Page<T>, EngineError> {
    let window = PageWindow::new(page_number, page_size)?;
    let slice = items
        .iter()
        .skip(usize::try_from(window.offset).unwrap_or(usize::MAX))
        .take(window.limit as usize)
        .cloned()
        .collect();
    Ok(window.finish(slice, items.len() as u64))
}

/// Builds a page from a stream of results, keeping only the requested window
/// in memory while counting everything.
#[derive(Debug)]
pub struct PageCollector<T> {
    window: PageWindow,
    seen: u64,
    items: Vec<T>,
}

impl<T> PageCollector<T> {
    pub fn new(window: PageWindow) -> Self {
        Self {
            window,
            seen: 0,
            items: Vec::new(),
        }
    }

    /// Whether the next pushed item would land on the page. Lets callers skip
    /// building items that would be discarded.
    pub fn wants_next(&self) -> bool {
        self.window.contains(self.seen)
    }

    pub fn push(&mut self, item: T) {
        if self.wants_next() {
            self.items.push(item);
        }
        self.seen += 1;
    }

    /// Counts an item without materializing it.
    pub fn skip(&mut self) {
        self.seen += 1;
    }

    pub fn finish(self) -> Page<T> {
        self.window.finish(self.items, self.seen)
    }
}
