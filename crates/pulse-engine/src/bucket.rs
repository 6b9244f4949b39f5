//! Time range resolution and local-time bucketing.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, Months, NaiveDate, NaiveDateTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;

use pulse_core::analytics::{Bucket, Granularity, RangePreset, RangeSpec, TimeRange};
use pulse_core::error::EngineError;

/// Longest DST gap searched when a local boundary does not exist.
const MAX_GAP_MINUTES: i64 = 48 * 60;

pub fn parse_timezone(raw: &str) -> Result<Tz, EngineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidRange("timezone must not be empty".to_string()));
    }
    trimmed
        .parse::<Tz>()
        .map_err(|_| EngineError::InvalidRange(format!("unknown timezone `{trimmed}`")))
}

/// Resolves a requested range to absolute bounds. The query's timezone wins
/// over the site's; UTC is the fallback.
pub fn resolve_range(
    spec: &RangeSpec,
    site_timezone: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TimeRange, EngineError> {
    let timezone = match spec.timezone().or(site_timezone) {
        Some(raw) => parse_timezone(raw)?,
        None => Tz::UTC,
    };

    let (start, end) = match spec {
        RangeSpec::Instants { start, end, .. } => (*start, *end),
        RangeSpec::Dates {
            start_date,
            end_date,
            ..
        } => {
            if start_date > end_date {
                return Err(EngineError::InvalidRange(format!(
                    "start_date {start_date} is after end_date {end_date}"
                )));
            }
            (
                local_midnight(timezone, *start_date)?,
                local_midnight(timezone, next_day(*end_date)?)?,
            )
        }
        RangeSpec::Preset { preset, .. } => {
            let today = now.with_timezone(&timezone).date_naive();
            let (first, last) = preset_dates(*preset, today)?;
            (
                local_midnight(timezone, first)?,
                local_midnight(timezone, next_day(last)?)?,
            )
        }
    };

    if start > end {
        return Err(EngineError::InvalidRange(format!(
            "start {start} is after end {end}"
        )));
    }
    Ok(TimeRange {
        start,
        end,
        timezone,
    })
}

/// Inclusive local dates covered by a preset.
fn preset_dates(
    preset: RangePreset,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), EngineError> {
    let days_back = |n: i64| {
        today
            .checked_sub_signed(Duration::days(n))
            .ok_or_else(|| EngineError::InvalidRange("date out of range".to_string()))
    };
    let month_start = today
        .with_day(1)
        .ok_or_else(|| EngineError::InvalidRange("date out of range".to_string()))?;
    Ok(match preset {
        RangePreset::Today => (today, today),
        RangePreset::Yesterday => {
            let yesterday = days_back(1)?;
            (yesterday, yesterday)
        }
        RangePreset::Last7Days => (days_back(6)?, today),
        RangePreset::Last30Days => (days_back(29)?, today),
        RangePreset::Last90Days => (days_back(89)?, today),
        RangePreset::MonthToDate => (month_start, today),
        RangePreset::Last12Months => (
            month_start
                .checked_sub_months(Months::new(11))
                .ok_or_else(|| EngineError::InvalidRange("date out of range".to_string()))?,
            today,
        ),
    })
}

fn next_day(date: NaiveDate) -> Result<NaiveDate, EngineError> {
    date.succ_opt()
        .ok_or_else(|| EngineError::InvalidRange("date out of range".to_string()))
}

fn local_midnight(tz: Tz, date: NaiveDate) -> Result<DateTime<Utc>, EngineError> {
    date.and_hms_opt(0, 0, 0)
        .and_then(|naive| local_instant(tz, naive))
        .ok_or_else(|| EngineError::InvalidRange(format!("no local midnight for {date}")))
}

/// First instant at or after a local wall-clock time. Ambiguous times take
/// the earlier instant; times inside a DST gap move to the end of the gap.
fn local_instant(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    let mut probe = naive;
    for _ in 0..=MAX_GAP_MINUTES {
        match tz.from_local_datetime(&probe) {
            LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(a, b) => return Some(a.min(b).with_timezone(&Utc)),
            LocalResult::None => probe = probe.checked_add_signed(Duration::minutes(1))?,
        }
    }
    None
}

/// Granularity picked when a query leaves it open.
pub fn auto_granularity(range: &TimeRange) -> Granularity {
    let span = range.end - range.start;
    if span <= Duration::days(2) {
        Granularity::Hour
    } else if span <= Duration::days(60) {
        Granularity::Day
    } else {
        Granularity::Month
    }
}

/// Nominal bucket count, used for error reporting without walking the range.
fn estimated_count(range: &TimeRange, granularity: Granularity) -> usize {
    let width = match granularity {
        Granularity::Minute => 60,
        Granularity::Hour => 3_600,
        Granularity::Day => 86_400,
        Granularity::Week => 7 * 86_400,
        Granularity::Month => 28 * 86_400,
    };
    let span = (range.end - range.start).num_seconds().max(0);
    usize::try_from((span + width - 1) / width).unwrap_or(usize::MAX)
}

/// Splits `range` into local-time buckets that exactly tile
/// `[range.start, range.end)`.
///
/// Fails with `GranularityTooFine` when more than `max_buckets` would be
/// produced. The returned iterator is lazy; clone it to restart.
pub fn bucketize(
    range: &TimeRange,
    granularity: Granularity,
    max_buckets: usize,
) -> Result<Buckets, EngineError> {
    if range.start > range.end {
        return Err(EngineError::InvalidRange(format!(
            "start {} is after end {}",
            range.start, range.end
        )));
    }
    let buckets = Buckets::new(*range, granularity);
    let produced = buckets.clone().take(max_buckets.saturating_add(1)).count();
    if produced > max_buckets {
        return Err(EngineError::GranularityTooFine {
            buckets: estimated_count(range, granularity).max(produced),
            max: max_buckets,
        });
    }
    Ok(buckets)
}

#[derive(Debug, Clone)]
pub struct Buckets {
    range: TimeRange,
    granularity: Granularity,
    /// Aligned start of the next bucket; `None` once exhausted.
    cursor: Option<DateTime<Utc>>,
}

impl Buckets {
    fn new(range: TimeRange, granularity: Granularity) -> Self {
        let cursor = if range.start < range.end {
            Some(floor(range.start, granularity, range.timezone))
        } else {
            None
        };
        Self {
            range,
            granularity,
            cursor,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }
}

impl Iterator for Buckets {
    type Item = Bucket;

    fn next(&mut self) -> Option<Bucket> {
        let boundary = self.cursor?;
        if boundary >= self.range.end {
            self.cursor = None;
            return None;
        }
        let next = next_boundary(boundary, self.granularity, self.range.timezone)
            .unwrap_or(self.range.end);
        self.cursor = Some(next);
        Some(Bucket {
            start: boundary.max(self.range.start),
            end: next.min(self.range.end),
            label: label(boundary, self.granularity, self.range.timezone),
        })
    }
}

/// Aligned local boundary at or before `instant`.
fn floor(instant: DateTime<Utc>, granularity: Granularity, tz: Tz) -> DateTime<Utc> {
    let local = instant.with_timezone(&tz);
    let sub_minute = Duration::seconds(i64::from(local.second()))
        + Duration::nanoseconds(i64::from(local.nanosecond()));
    let aligned = match granularity {
        Granularity::Minute => Some(instant - sub_minute),
        Granularity::Hour => {
            Some(instant - sub_minute - Duration::minutes(i64::from(local.minute())))
        }
        Granularity::Day => local_day_start(tz, local.date_naive()),
        Granularity::Week => {
            let offset = i64::from(local.weekday().num_days_from_monday());
            local
                .date_naive()
                .checked_sub_signed(Duration::days(offset))
                .and_then(|monday| local_day_start(tz, monday))
        }
        Granularity::Month => local
            .date_naive()
            .with_day(1)
            .and_then(|first| local_day_start(tz, first)),
    };
    // A boundary past the instant means the local day started inside a gap
    // that swallowed it; the instant itself is the earliest usable start.
    aligned.filter(|b| *b <= instant).unwrap_or(instant)
}

fn next_boundary(
    boundary: DateTime<Utc>,
    granularity: Granularity,
    tz: Tz,
) -> Option<DateTime<Utc>> {
    let local_date = boundary.with_timezone(&tz).date_naive();
    let next = match granularity {
        Granularity::Minute => Some(boundary + Duration::minutes(1)),
        Granularity::Hour => Some(boundary + Duration::hours(1)),
        Granularity::Day => local_date
            .succ_opt()
            .and_then(|d| local_day_start(tz, d)),
        Granularity::Week => {
            let offset = i64::from(local_date.weekday().num_days_from_monday());
            local_date
                .checked_add_signed(Duration::days(7 - offset))
                .and_then(|d| local_day_start(tz, d))
        }
        Granularity::Month => local_date
            .with_day(1)
            .and_then(|d| d.checked_add_months(Months::new(1)))
            .and_then(|d| local_day_start(tz, d)),
    };
    next.filter(|n| *n > boundary)
}

fn local_day_start(tz: Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).and_then(|naive| local_instant(tz, naive))
}

fn label(boundary: DateTime<Utc>, granularity: Granularity, tz: Tz) -> String {
    let local = boundary.with_timezone(&tz);
    let format = match granularity {
        Granularity::Minute => "%Y-%m-%d %H:%M",
        Granularity::Hour => "%Y-%m-%d %H:00",
        Granularity::Day | Granularity::Week => "%Y-%m-%d",
        Granularity::Month => "%Y-%m",
    };
    local.format(format).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn range(start: DateTime<Utc>, end: DateTime<Utc>, tz: &str) -> TimeRange {
        TimeRange {
            start,
            end,
            timezone: tz.parse().unwrap(),
        }
    }

    fn assert_tiles(range: &TimeRange, buckets: &[Bucket]) {
        assert_eq!(buckets.first().map(|b| b.start), Some(range.start));
        assert_eq!(buckets.last().map(|b| b.end), Some(range.end));
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert!(buckets.iter().all(|b| b.start < b.end));
    }

    #[test]
    fn day_buckets_follow_dst_in_new_york() {
        // 2026-03-08 is 23 hours long, 2026-11-01 is 25 hours long.
        let dates = RangeSpec::Dates {
            start_date: NaiveDate::from_ymd_opt(2026, 3, 7).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(),
            timezone: Some("America/New_York".to_string()),
        };
        let r = resolve_range(&dates, None, Utc::now()).unwrap();
        let buckets: Vec<_> = bucketize(&r, Granularity::Day, 1000).unwrap().collect();
        assert_eq!(buckets.len(), 3);
        assert_tiles(&r, &buckets);
        let hours: Vec<i64> = buckets.iter().map(|b| (b.end - b.start).num_hours()).collect();
        assert_eq!(hours, vec![24, 23, 24]);
        assert_eq!(buckets[1].label, "2026-03-08");

        let fall = RangeSpec::Dates {
            start_date: NaiveDate::from_ymd_opt(2026, 11, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 11, 1).unwrap(),
            timezone: Some("America/New_York".to_string()),
        };
        let r = resolve_range(&fall, None, Utc::now()).unwrap();
        let buckets: Vec<_> = bucketize(&r, Granularity::Day, 1000).unwrap().collect();
        assert_eq!((buckets[0].end - buckets[0].start).num_hours(), 25);
    }

    #[test]
    fn fall_back_hour_appears_twice() {
        let r = range(utc(2026, 11, 1, 4, 0), utc(2026, 11, 1, 8, 0), "America/New_York");
        let buckets: Vec<_> = bucketize(&r, Granularity::Hour, 1000).unwrap().collect();
        assert_eq!(buckets.len(), 4);
        let labels: Vec<_> = buckets.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["2026-11-01 00:00", "2026-11-01 01:00", "2026-11-01 01:00", "2026-11-01 02:00"]
        );
    }

    #[test]
    fn partial_boundary_buckets() {
        let r = range(utc(2026, 1, 1, 10, 30), utc(2026, 1, 3, 6, 0), "UTC");
        let buckets: Vec<_> = bucketize(&r, Granularity::Day, 1000).unwrap().collect();
        assert_eq!(buckets.len(), 3);
        assert_tiles(&r, &buckets);
        assert_eq!(buckets[0].label, "2026-01-01");
        assert_eq!((buckets[2].end - buckets[2].start).num_hours(), 6);
    }

    #[test]
    fn weeks_start_on_monday() {
        // 2026-03-04 is a Wednesday.
        let r = range(utc(2026, 3, 4, 0, 0), utc(2026, 3, 20, 0, 0), "UTC");
        let buckets: Vec<_> = bucketize(&r, Granularity::Week, 1000).unwrap().collect();
        assert_eq!(buckets[0].label, "2026-03-02");
        assert_eq!(buckets[1].start, utc(2026, 3, 9, 0, 0));
        assert_tiles(&r, &buckets);
    }

    #[test]
    fn month_labels_in_local_time() {
        let r = range(utc(2026, 1, 1, 0, 0), utc(2026, 4, 1, 0, 0), "Asia/Tokyo");
        let labels: Vec<_> = bucketize(&r, Granularity::Month, 1000)
            .unwrap()
            .map(|b| b.label)
            .collect();
        assert_eq!(labels, vec!["2026-01", "2026-02", "2026-03", "2026-04"]);
    }

    #[test]
    fn empty_range_yields_no_buckets() {
        let at = utc(2026, 1, 1, 0, 0);
        let r = range(at, at, "UTC");
        assert_eq!(bucketize(&r, Granularity::Hour, 10).unwrap().count(), 0);
    }

    #[test]
    fn too_many_buckets_is_rejected() {
        let r = range(utc(2026, 1, 1, 0, 0), utc(2026, 1, 3, 0, 0), "UTC");
        let err = bucketize(&r, Granularity::Minute, 1000).unwrap_err();
        match err {
            EngineError::GranularityTooFine { buckets, max } => {
                assert_eq!(buckets, 2880);
                assert_eq!(max, 1000);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn buckets_restart_from_clone() {
        let r = range(utc(2026, 1, 1, 0, 0), utc(2026, 1, 1, 5, 0), "UTC");
        let buckets = bucketize(&r, Granularity::Hour, 100).unwrap();
        let first: Vec<_> = buckets.clone().collect();
        let second: Vec<_> = buckets.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn reversed_range_is_invalid() {
        let spec = RangeSpec::Instants {
            start: utc(2026, 1, 2, 0, 0),
            end: utc(2026, 1, 1, 0, 0),
            timezone: None,
        };
        assert_eq!(resolve_range(&spec, None, Utc::now()).unwrap_err().kind(), "invalid_range");
    }

    #[test]
    fn unknown_timezone_is_invalid_range() {
        let spec = RangeSpec::Preset {
            preset: RangePreset::Today,
            timezone: Some("Mars/Olympus".to_string()),
        };
        assert_eq!(resolve_range(&spec, None, Utc::now()).unwrap_err().kind(), "invalid_range");
    }

    #[test]
    fn presets_resolve_against_site_timezone() {
        let now = utc(2026, 3, 15, 2, 0);
        let spec = RangeSpec::Preset {
            preset: RangePreset::Last7Days,
            timezone: None,
        };
        // 02:00 UTC is still March 14 in Los Angeles.
        let r = resolve_range(&spec, Some("America/Los_Angeles"), now).unwrap();
        assert_eq!(r.start, utc(2026, 3, 8, 8, 0));
        assert_eq!(r.end, utc(2026, 3, 15, 7, 0));

        let mtd = RangeSpec::Preset {
            preset: RangePreset::MonthToDate,
            timezone: Some("UTC".to_string()),
        };
        let r = resolve_range(&mtd, Some("America/Los_Angeles"), now).unwrap();
        assert_eq!(r.start, utc(2026, 3, 1, 0, 0));
        assert_eq!(r.end, utc(2026, 3, 16, 0, 0));
    }

    #[test]
    fn missing_local_midnight_moves_forward() {
        // Santiago springs forward at local midnight on 2026-09-06.
        let tz: Tz = "America/Santiago".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 9, 6).unwrap();
        let start = local_midnight(tz, date).unwrap();
        assert_eq!(start.with_timezone(&tz).hour(), 1);
    }

    #[test]
    fn auto_granularity_by_span() {
        let hourly = range(utc(2026, 1, 1, 0, 0), utc(2026, 1, 2, 0, 0), "UTC");
        assert_eq!(auto_granularity(&hourly), Granularity::Hour);
        let daily = range(utc(2026, 1, 1, 0, 0), utc(2026, 2, 1, 0, 0), "UTC");
        assert_eq!(auto_granularity(&daily), Granularity::Day);
        let monthly = range(utc(2026, 1, 1, 0, 0), utc(2026, 12, 1, 0, 0), "UTC");
        assert_eq!(auto_granularity(&monthly), Granularity::Month);
    }
}
