use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event name recorded for page loads. Every other name is a custom event.
pub const PAGEVIEW: &str = "pageview";

/// A loosely-typed property value attached to an event.
///
/// Serialized untagged, so `{"plan": "pro", "seats": 3, "trial": false,
/// "tags": ["a", "b"]}` round-trips without wrapper objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    String(String),
    Number(f64),
    Bool(bool),
    List(Vec<String>),
}

/// The variant of a [`PropertyValue`], used by the filter type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Number,
    Bool,
    List,
}

impl PropertyValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyValue::String(_) => ValueKind::String,
            PropertyValue::Number(_) => ValueKind::Number,
            PropertyValue::Bool(_) => ValueKind::Bool,
            PropertyValue::List(_) => ValueKind::List,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// A stored, immutable analytics event as returned by the raw event store.
///
/// Within a session the ordering key is `(session_id, timestamp, sequence_no)`;
/// no two events of the same session share `(timestamp, sequence_no)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub site_id: String,
    pub session_id: String,
    #[serde(alias = "user_id")]
    pub visitor_id: String,
    /// `"pageview"` for page loads, otherwise the custom event name.
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub sequence_no: u64,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    pub page_url: Option<String>,
    pub referrer: Option<String>,
}

impl Event {
    pub fn is_pageview(&self) -> bool {
        self.name == PAGEVIEW
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Ordering key used by the store and by session stitching.
    pub fn ordering_key(&self) -> (&str, DateTime<Utc>, u64) {
        (&self.session_id, self.timestamp, self.sequence_no)
    }
}
