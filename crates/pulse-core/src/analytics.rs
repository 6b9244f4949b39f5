//! Request and result shapes of the aggregation engine.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::event::PropertyValue;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Contains,
    NotContains,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Ne => "ne",
            FilterOperator::Contains => "contains",
            FilterOperator::NotContains => "not_contains",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not_in",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub parameter: String,
    pub operator: FilterOperator,
    pub value: PropertyValue,
}

impl Filter {
    pub fn new(
        parameter: impl Into<String>,
        operator: FilterOperator,
        value: impl Into<PropertyValue>,
    ) -> Self {
        Self {
            parameter: parameter.into(),
            operator,
            value: value.into(),
        }
    }
}

/// One entry of a conjunctive filter list.
///
/// `AnyOf` holds alternatives: an OR over AND-groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterExpr {
    AnyOf { any_of: Vec<Vec<Filter>> },
    Condition(Filter),
}

impl From<Filter> for FilterExpr {
    fn from(filter: Filter) -> Self {
        FilterExpr::Condition(filter)
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePreset {
    Today,
    Yesterday,
    Last7Days,
    Last30Days,
    Last90Days,
    MonthToDate,
    Last12Months,
}

/// A time range as requested by a caller, resolved to a [`TimeRange`] at
/// query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RangeSpec {
    /// Absolute instants, `[start, end)`.
    Instants {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timezone: Option<String>,
    },
    /// Inclusive local calendar dates.
    Dates {
        start_date: NaiveDate,
        end_date: NaiveDate,
        timezone: Option<String>,
    },
    Preset {
        preset: RangePreset,
        timezone: Option<String>,
    },
}

impl RangeSpec {
    pub fn timezone(&self) -> Option<&str> {
        match self {
            RangeSpec::Instants { timezone, .. }
            | RangeSpec::Dates { timezone, .. }
            | RangeSpec::Preset { timezone, .. } => timezone.as_deref(),
        }
    }
}

/// A resolved, validated half-open range `[start, end)` with the timezone
/// used for local bucket boundaries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timezone: Tz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Sessions,
    Pageviews,
    Visitors,
    Events,
    BounceRate,
    #[serde(alias = "duration")]
    AvgDuration,
}

/// Dimension used to split a metric series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Dimension {
    /// Normalized page path of pageviews.
    Page,
    EventName,
    Referrer,
    /// Any event property, e.g. `country` or `device`.
    Property(String),
}

impl TryFrom<String> for Dimension {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let trimmed = raw.trim();
        match trimmed {
            "" => Err("group_by must not be empty".to_string()),
            "page" | "path" => Ok(Dimension::Page),
            "event_name" | "name" | "event" => Ok(Dimension::EventName),
            "referrer" => Ok(Dimension::Referrer),
            other => {
                let key = other.strip_prefix("properties.").unwrap_or(other);
                if key.is_empty() {
                    Err("group_by property key must not be empty".to_string())
                } else {
                    Ok(Dimension::Property(key.to_string()))
                }
            }
        }
    }
}

impl From<Dimension> for String {
    fn from(dimension: Dimension) -> Self {
        match dimension {
            Dimension::Page => "page".to_string(),
            Dimension::EventName => "event_name".to_string(),
            Dimension::Referrer => "referrer".to_string(),
            Dimension::Property(key) => key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub range: RangeSpec,
    /// `None` picks a granularity from the range span.
    pub granularity: Option<Granularity>,
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub filters: Vec<FilterExpr>,
    pub group_by: Option<Dimension>,
}

/// Values of the requested metrics. Unrequested metrics stay `None` and are
/// omitted from JSON; requested ones are always present (zero when empty).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pageviews: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitors: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<u64>,
    /// Fraction of sessions with exactly one pageview, 0–1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounce_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupValues {
    pub value: String,
    pub metrics: MetricValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    #[serde(flatten)]
    pub bucket: Bucket,
    pub metrics: MetricValues,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<GroupValues>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResult {
    pub granularity: Granularity,
    pub timezone: String,
    pub series: Vec<SeriesPoint>,
    pub totals: MetricValues,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<GroupValues>>,
}

// ---------------------------------------------------------------------------
// Funnels
// ---------------------------------------------------------------------------

/// What an event must look like to satisfy a funnel step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepMatcher {
    /// Custom event with this exact name.
    Event { name: String },
    /// Pageview whose normalized path equals the normalized `path`.
    Page { path: String },
    Filters { filters: Vec<FilterExpr> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStep {
    pub label: Option<String>,
    #[serde(flatten)]
    pub matcher: StepMatcher,
    /// Maximum time since the previous step was reached.
    pub window_seconds: Option<u64>,
}

impl FunnelStep {
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            label: None,
            matcher: StepMatcher::Event { name: name.into() },
            window_seconds: None,
        }
    }

    pub fn page(path: impl Into<String>) -> Self {
        Self {
            label: None,
            matcher: StepMatcher::Page { path: path.into() },
            window_seconds: None,
        }
    }

    pub fn with_window(mut self, seconds: u64) -> Self {
        self.window_seconds = Some(seconds);
        self
    }

    pub fn display_label(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        match &self.matcher {
            StepMatcher::Event { name } => name.clone(),
            StepMatcher::Page { path } => path.clone(),
            StepMatcher::Filters { filters } => format!("{} filter(s)", filters.len()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelQuery {
    pub range: RangeSpec,
    pub steps: Vec<FunnelStep>,
    #[serde(default)]
    pub filters: Vec<FilterExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Sessions that reached the step (and possibly went further).
    Reached,
    /// Sessions that reached the step and never the next one.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStepResult {
    pub step: u32,
    pub label: String,
    pub reached: u64,
    pub dropped: u64,
    pub drop_off_rate: f64,
    pub conversion_rate_from_start: f64,
    pub conversion_rate_from_previous: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelResult {
    pub total_sessions_entered: u64,
    pub final_conversion_rate: f64,
    pub steps: Vec<FunnelStepResult>,
}

impl FunnelResult {
    pub fn reached(&self) -> Vec<u64> {
        self.steps.iter().map(|s| s.reached).collect()
    }

    pub fn dropped(&self) -> Vec<u64> {
        self.steps.iter().map(|s| s.dropped).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSessionsQuery {
    pub range: RangeSpec,
    pub steps: Vec<FunnelStep>,
    #[serde(default)]
    pub filters: Vec<FilterExpr>,
    /// 1-indexed step number.
    pub step: u32,
    pub mode: StepMode,
    #[serde(flatten)]
    pub page: PageRequest,
}

// ---------------------------------------------------------------------------
// Sessions & pagination
// ---------------------------------------------------------------------------

fn default_page_limit() -> u32 {
    50
}

/// Either a 1-indexed page number or an opaque offset cursor. A cursor wins
/// when both are given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: Option<u32>,
    #[serde(default = "default_page_limit")]
    pub limit: u32,
    pub cursor: Option<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: None,
            limit: default_page_limit(),
            cursor: None,
        }
    }
}

impl PageRequest {
    pub fn page(number: u32, limit: u32) -> Self {
        Self {
            page: Some(number),
            limit,
            cursor: None,
        }
    }

    pub fn cursor(cursor: impl Into<String>, limit: u32) -> Self {
        Self {
            page: None,
            limit,
            cursor: Some(cursor.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionListItem {
    pub session_id: String,
    pub visitor_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub duration_seconds: i64,
    pub event_count: u64,
    pub pageview_count: u64,
    pub entry_page: Option<String>,
    pub exit_page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reached_steps: Option<u32>,
}

// ---------------------------------------------------------------------------
// Journeys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyQuery {
    pub range: RangeSpec,
    #[serde(default)]
    pub filters: Vec<FilterExpr>,
    pub max_steps: u32,
    /// Position-indexed constraints; `None` leaves a position free.
    #[serde(default)]
    pub step_filters: Vec<Option<Vec<FilterExpr>>>,
    /// Maximum number of ranked paths returned.
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyPath {
    pub path: Vec<String>,
    pub count: u64,
    pub share: f64,
}

/// Node of the prefix tree of observed paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyBranch {
    pub label: String,
    /// Sessions whose path passes through this node.
    pub sessions: u64,
    /// Sessions whose path ends at this node.
    pub exits: u64,
    pub children: Vec<JourneyBranch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyResult {
    pub max_steps: u32,
    pub total_sessions: u64,
    pub total_paths: u64,
    pub paths: Vec<JourneyPath>,
    pub branches: Vec<JourneyBranch>,
}

// ---------------------------------------------------------------------------
// Goals & sites
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    PageView,
    Event,
    Funnel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GoalDefinition {
    Predicate { matcher: StepMatcher },
    Steps { steps: Vec<FunnelStep> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub site_id: String,
    pub name: String,
    pub goal_type: GoalType,
    pub definition: GoalDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalQuery {
    pub range: RangeSpec,
    #[serde(default)]
    pub filters: Vec<FilterExpr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalSessionsQuery {
    pub range: RangeSpec,
    #[serde(default)]
    pub filters: Vec<FilterExpr>,
    #[serde(flatten)]
    pub page: PageRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalStats {
    pub goal_id: String,
    pub conversions: u64,
    pub total_sessions: u64,
    /// `None` when the range has no sessions at all.
    pub conversion_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub id: String,
    pub name: String,
    /// IANA timezone used when a query does not name one.
    pub timezone: String,
    pub public: bool,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn filter_expr_parses_condition_and_alternatives() {
        let raw = json!([
            { "parameter": "country", "operator": "eq", "value": "PL" },
            { "any_of": [
                [{ "parameter": "path", "operator": "eq", "value": "/pricing" }],
                [{ "parameter": "name", "operator": "in", "value": ["signup", "trial"] }]
            ]}
        ]);
        let exprs: Vec<FilterExpr> = serde_json::from_value(raw).expect("parse");
        assert!(matches!(exprs[0], FilterExpr::Condition(_)));
        match &exprs[1] {
            FilterExpr::AnyOf { any_of } => assert_eq!(any_of.len(), 2),
            other => panic!("unexpected expr: {other:?}"),
        }
    }

    #[test]
    fn funnel_step_flattens_matcher() {
        let raw = json!({ "type": "page", "path": "/pricing", "label": null, "window_seconds": 600 });
        let step: FunnelStep = serde_json::from_value(raw).expect("parse");
        assert_eq!(step.matcher, StepMatcher::Page { path: "/pricing".to_string() });
        assert_eq!(step.window_seconds, Some(600));
        assert_eq!(step.display_label(), "/pricing");
    }

    #[test]
    fn dimension_parses_builtins_and_properties() {
        assert_eq!(Dimension::try_from("page".to_string()), Ok(Dimension::Page));
        assert_eq!(
            Dimension::try_from("properties.country".to_string()),
            Ok(Dimension::Property("country".to_string()))
        );
        assert!(Dimension::try_from("  ".to_string()).is_err());
    }

    #[test]
    fn range_spec_is_tagged_by_type() {
        let raw = json!({ "type": "preset", "preset": "last_7_days", "timezone": "Europe/Warsaw" });
        let spec: RangeSpec = serde_json::from_value(raw).expect("parse");
        assert_eq!(spec.timezone(), Some("Europe/Warsaw"));
    }

    #[test]
    fn goal_stats_serializes_null_rate() {
        let stats = GoalStats {
            goal_id: "goal_1".to_string(),
            conversions: 0,
            total_sessions: 0,
            conversion_rate: None,
        };
        let value = serde_json::to_value(&stats).expect("serialize");
        assert!(value["conversion_rate"].is_null());
    }
}
