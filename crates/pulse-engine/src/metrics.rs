//! Bucketed metric series, optionally split by a dimension.

use std::collections::{HashMap, HashSet};

use futures_util::{stream, StreamExt, TryStreamExt};

use pulse_core::analytics::{
    AggregateQuery, AggregateResult, Bucket, Dimension, GroupValues, Metric, MetricValues,
    SeriesPoint, TimeRange,
};
use pulse_core::error::EngineError;
use pulse_core::event::{Event, PropertyValue};
use pulse_core::store::{DistinctField, ScanRequest};

use crate::bucket::{auto_granularity, bucketize};
use crate::filter::Predicate;
use crate::paths::normalize_path;
use crate::retry::with_storage_retry;
use crate::session::{fold_sessions, ScanScope, SessionRun};

pub const OTHER_GROUP: &str = "other";
pub const NONE_GROUP: &str = "(none)";

/// Running sums for one bucket or group.
#[derive(Debug, Default, Clone)]
struct Tally {
    sessions: u64,
    pageviews: u64,
    events: u64,
    bounces: u64,
    duration_seconds: f64,
    visitors: HashSet<String>,
}

impl Tally {
    fn add(&mut self, run: &SessionRun, session: &SessionStats, pageviews: u64, events: u64) {
        self.sessions += 1;
        self.pageviews += pageviews;
        self.events += events;
        if session.bounce {
            self.bounces += 1;
        }
        self.duration_seconds += session.duration_seconds;
        if !self.visitors.contains(run.visitor_id()) {
            self.visitors.insert(run.visitor_id().to_string());
        }
    }

    fn values(&self, metrics: &[Metric], visitors: Option<u64>) -> MetricValues {
        let mut out = MetricValues::default();
        for metric in metrics {
            match metric {
                Metric::Sessions => out.sessions = Some(self.sessions),
                Metric::Pageviews => out.pageviews = Some(self.pageviews),
                Metric::Visitors => {
                    out.visitors = Some(visitors.unwrap_or(self.visitors.len() as u64))
                }
                Metric::Events => out.events = Some(self.events),
                Metric::BounceRate => out.bounce_rate = Some(mean(self.bounces as f64, self.sessions)),
                Metric::AvgDuration => {
                    out.avg_duration_seconds = Some(mean(self.duration_seconds, self.sessions))
                }
            }
        }
        out
    }
}

fn mean(total: f64, sessions: u64) -> f64 {
    if sessions == 0 {
        0.0
    } else {
        total / sessions as f64
    }
}

/// Whole-session figures attributed to every group a session touches.
struct SessionStats {
    bounce: bool,
    duration_seconds: f64,
}

/// How events map to group keys. With `keep`, keys outside it fold into
/// [`OTHER_GROUP`].
struct Grouping {
    dimension: Dimension,
    keep: Option<HashSet<String>>,
}

impl Grouping {
    fn key(&self, event: &Event) -> String {
        let raw = dimension_value(event, &self.dimension).unwrap_or_else(|| NONE_GROUP.to_string());
        match &self.keep {
            Some(keep) if !keep.contains(&raw) => OTHER_GROUP.to_string(),
            _ => raw,
        }
    }
}

fn dimension_value(event: &Event, dimension: &Dimension) -> Option<String> {
    match dimension {
        Dimension::Page => event
            .page_url
            .as_deref()
            .map(normalize_path)
            .filter(|p| !p.is_empty()),
        Dimension::EventName => Some(event.name.clone()),
        Dimension::Referrer => event
            .referrer
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string),
        Dimension::Property(key) => event.property(key).map(display_value),
    }
}

fn display_value(value: &PropertyValue) -> String {
    match value {
        PropertyValue::String(s) => s.clone(),
        PropertyValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        PropertyValue::Number(n) => n.to_string(),
        PropertyValue::Bool(b) => b.to_string(),
        PropertyValue::List(items) => items.join(","),
    }
}

#[derive(Debug, Default)]
struct Pass {
    total: Tally,
    groups: HashMap<String, Tally>,
}

impl Pass {
    fn visit(&mut self, run: SessionRun, grouping: Option<&Grouping>) {
        let summary = run.summary();
        let stats = SessionStats {
            bounce: summary.is_bounce(),
            duration_seconds: summary.duration_seconds(),
        };
        self.total
            .add(&run, &stats, summary.pageview_count, summary.event_count);

        let Some(grouping) = grouping else {
            return;
        };
        let mut touched: HashMap<String, (u64, u64)> = HashMap::new();
        for event in &run.events {
            let counts = touched.entry(grouping.key(event)).or_default();
            if event.is_pageview() {
                counts.0 += 1;
            }
            counts.1 += 1;
        }
        for (key, (pageviews, events)) in touched {
            self.groups
                .entry(key)
                .or_default()
                .add(&run, &stats, pageviews, events);
        }
    }
}

/// Group keys in output order: by sessions descending, then key ascending.
fn rank_groups(groups: &HashMap<String, Tally>) -> Vec<String> {
    let mut ranked: Vec<(&String, u64)> = groups.iter().map(|(k, t)| (k, t.sessions)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().map(|(k, _)| k.clone()).collect()
}

enum Job {
    Totals,
    Series(Bucket),
}

async fn run_pass(
    scope: ScanScope<'_>,
    request: &ScanRequest,
    predicate: &Predicate,
    grouping: Option<&Grouping>,
) -> Result<Pass, EngineError> {
    fold_sessions(scope, request, predicate, Pass::default, |pass, run| {
        pass.visit(run, grouping);
        Ok(())
    })
    .await
}

fn requested_metrics(query: &AggregateQuery) -> Result<Vec<Metric>, EngineError> {
    if query.metrics.is_empty() {
        return Err(EngineError::InvalidQuery(
            "at least one metric is required".to_string(),
        ));
    }
    let mut metrics = Vec::with_capacity(query.metrics.len());
    for metric in &query.metrics {
        if !metrics.contains(metric) {
            metrics.push(*metric);
        }
    }
    Ok(metrics)
}

/// Computes the series, totals and group breakdown of `query` over `range`.
///
/// Group ranking is global: one pass over the whole range picks the top-K
/// keys, and every bucket reports exactly those keys (zeros included) with
/// the rest folded into `"other"`. Bucket passes run concurrently up to the
/// scan concurrency limit and are merged in bucket order.
pub async fn aggregate(
    scope: ScanScope<'_>,
    request: &ScanRequest,
    predicate: &Predicate,
    range: &TimeRange,
    query: &AggregateQuery,
) -> Result<AggregateResult, EngineError> {
    let metrics = requested_metrics(query)?;
    let granularity = query
        .granularity
        .unwrap_or_else(|| auto_granularity(range));
    let buckets: Vec<Bucket> = bucketize(range, granularity, scope.limits.max_buckets)?.collect();

    // Ranking pass. Its tallies double as totals when nothing is folded.
    let mut ranked_totals = None;
    let mut group_order = Vec::new();
    let mut has_other = false;
    let grouping = match &query.group_by {
        Some(dimension) => {
            let raw = Grouping {
                dimension: dimension.clone(),
                keep: None,
            };
            let pass = run_pass(scope, request, predicate, Some(&raw)).await?;
            let ranked = rank_groups(&pass.groups);
            let top_k = scope.limits.group_top_k.max(1);
            has_other = ranked.len() > top_k;
            group_order = ranked.into_iter().take(top_k).collect::<Vec<_>>();
            let keep = has_other.then(|| group_order.iter().cloned().collect());
            if !has_other {
                ranked_totals = Some(pass);
            }
            Some(Grouping {
                dimension: dimension.clone(),
                keep,
            })
        }
        None => None,
    };
    if has_other {
        group_order.push(OTHER_GROUP.to_string());
    }

    let mut jobs: Vec<Job> = Vec::with_capacity(buckets.len() + 1);
    if ranked_totals.is_none() {
        jobs.push(Job::Totals);
    }
    jobs.extend(buckets.into_iter().map(Job::Series));

    let grouping = grouping.as_ref();
    let finished: Vec<(Job, Pass)> = stream::iter(jobs)
        .map(|job| async move {
            let pass = match &job {
                Job::Totals => run_pass(scope, request, predicate, grouping).await?,
                Job::Series(bucket) => {
                    let narrowed = request.narrowed(bucket.start, bucket.end);
                    run_pass(scope, &narrowed, predicate, grouping).await?
                }
            };
            Ok::<_, EngineError>((job, pass))
        })
        .buffered(scope.limits.scan_concurrency.max(1))
        .try_collect()
        .await?;

    let mut totals_pass = ranked_totals;
    let mut series = Vec::with_capacity(finished.len());
    for (job, pass) in finished {
        match job {
            Job::Totals => totals_pass = Some(pass),
            Job::Series(bucket) => series.push(SeriesPoint {
                bucket,
                metrics: pass.total.values(&metrics, None),
                groups: grouping.map(|_| group_values(&pass, &group_order, &metrics)),
            }),
        }
    }
    let totals_pass = totals_pass.unwrap_or_default();

    let visitors = if metrics.contains(&Metric::Visitors) {
        let distinct = with_storage_retry(scope.ctx, scope.limits, "count_distinct", || async {
            scope
                .store
                .count_distinct(DistinctField::Visitor, request)
                .await
                .map_err(EngineError::from)
        })
        .await?;
        Some(distinct)
    } else {
        None
    };

    Ok(AggregateResult {
        granularity,
        timezone: range.timezone.name().to_string(),
        series,
        totals: totals_pass.total.values(&metrics, visitors),
        groups: grouping.map(|_| group_values(&totals_pass, &group_order, &metrics)),
    })
}

fn group_values(pass: &Pass, order: &[String], metrics: &[Metric]) -> Vec<GroupValues> {
    let empty = Tally::default();
    order
        .iter()
        .map(|key| GroupValues {
            value: key.clone(),
            metrics: pass.groups.get(key).unwrap_or(&empty).values(metrics, None),
        })
        .collect()
}
