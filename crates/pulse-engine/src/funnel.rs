//! Ordered multi-step funnels evaluated per session.
//!
//! Each session is walked once in event order with a cursor on the next
//! unreached step. A step is reached at its first matching event after the
//! previous step (first touch), so a session reaches step `i` only after
//! every step before it. One event advances the cursor by at most one step.

use chrono::Duration;

use pulse_core::analytics::{
    FunnelResult, FunnelStep, FunnelStepResult, Page, SessionListItem, StepMatcher, StepMode,
};
use pulse_core::error::EngineError;
use pulse_core::event::Event;
use pulse_core::store::ScanRequest;

use crate::filter::{self, Predicate};
use crate::pagination::{PageCollector, PageWindow};
use crate::paths::{normalize_path, pageview_path};
use crate::session::{fold_sessions, ScanScope};

pub const MIN_FUNNEL_STEPS: usize = 2;
pub const MAX_FUNNEL_STEPS: usize = 8;

/// A compiled step matcher, shared with goals and journeys.
#[derive(Debug, Clone)]
pub enum CompiledStep {
    Event(String),
    Page(String),
    Filters(Predicate),
}

impl CompiledStep {
    pub fn compile(matcher: &StepMatcher) -> Result<Self, EngineError> {
        match matcher {
            StepMatcher::Event { name } => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(EngineError::InvalidFunnel(
                        "event step needs a name".to_string(),
                    ));
                }
                Ok(CompiledStep::Event(name.to_string()))
            }
            StepMatcher::Page { path } => {
                let normalized = normalize_path(path);
                if normalized.is_empty() {
                    return Err(EngineError::InvalidFunnel(
                        "page step needs a path".to_string(),
                    ));
                }
                Ok(CompiledStep::Page(normalized))
            }
            StepMatcher::Filters { filters } => {
                if filters.is_empty() {
                    return Err(EngineError::InvalidFunnel(
                        "filter step needs at least one filter".to_string(),
                    ));
                }
                Ok(CompiledStep::Filters(filter::compile(filters)?))
            }
        }
    }

    pub fn evaluate(&self, event: &Event) -> Result<bool, EngineError> {
        match self {
            CompiledStep::Event(name) => Ok(!event.is_pageview() && event.name == *name),
            CompiledStep::Page(path) => Ok(pageview_path(event).as_deref() == Some(path)),
            CompiledStep::Filters(predicate) => predicate.evaluate(event),
        }
    }
}

#[derive(Debug, Clone)]
struct Stage {
    step: CompiledStep,
    window: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CompiledFunnel {
    stages: Vec<Stage>,
    labels: Vec<String>,
}

impl CompiledFunnel {
    /// Validates and compiles `steps`; funnels need at least `min_steps`.
    pub fn compile(steps: &[FunnelStep], min_steps: usize) -> Result<Self, EngineError> {
        if steps.len() < min_steps {
            return Err(EngineError::InvalidFunnel(format!(
                "a funnel needs at least {min_steps} steps, got {}",
                steps.len()
            )));
        }
        if steps.len() > MAX_FUNNEL_STEPS {
            return Err(EngineError::InvalidFunnel(format!(
                "a funnel has at most {MAX_FUNNEL_STEPS} steps, got {}",
                steps.len()
            )));
        }

        let mut stages = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            // The first step has nothing to be windowed against.
            let window = match step.window_seconds {
                _ if index == 0 => None,
                Some(0) => {
                    return Err(EngineError::InvalidFunnel(format!(
                        "step {} has a zero-second window",
                        index + 1
                    )))
                }
                Some(seconds) => Some(
                    i64::try_from(seconds)
                        .ok()
                        .and_then(Duration::try_seconds)
                        .ok_or_else(|| {
                            EngineError::InvalidFunnel(format!(
                                "step {} window is too large",
                                index + 1
                            ))
                        })?,
                ),
                None => None,
            };
            stages.push(Stage {
                step: CompiledStep::compile(&step.matcher)?,
                window,
            });
        }

        Ok(Self {
            stages,
            labels: steps.iter().map(FunnelStep::display_label).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Number of consecutive steps the ordered `events` reach, `0..=len`.
    pub fn depth(&self, events: &[Event]) -> Result<usize, EngineError> {
        let mut reached = 0usize;
        let mut last_reached_at = None;
        for event in events {
            let Some(stage) = self.stages.get(reached) else {
                break;
            };
            if let (Some(window), Some(at)) = (stage.window, last_reached_at) {
                if event.timestamp - at > window {
                    // First touch of the previous step is fixed; nothing later
                    // can fall back inside its window.
                    break;
                }
            }
            if stage.step.evaluate(event)? {
                reached += 1;
                last_reached_at = Some(event.timestamp);
            }
        }
        Ok(reached)
    }
}

pub async fn evaluate_funnel(
    scope: ScanScope<'_>,
    request: &ScanRequest,
    predicate: &Predicate,
    funnel: &CompiledFunnel,
) -> Result<FunnelResult, EngineError> {
    // counts[d]: sessions reaching exactly d steps.
    let counts = fold_sessions(
        scope,
        request,
        predicate,
        || vec![0u64; funnel.len() + 1],
        |counts, run| {
            let depth = funnel.depth(&run.events)?;
            counts[depth] += 1;
            Ok(())
        },
    )
    .await?;
    Ok(summarize(funnel, &counts))
}

/// Turns a depth histogram into per-step figures. Depth-0 sessions never
/// entered the funnel and are not counted anywhere.
fn summarize(funnel: &CompiledFunnel, counts: &[u64]) -> FunnelResult {
    let n = funnel.len();
    let reached: Vec<u64> = (0..n).map(|i| counts[i + 1..].iter().sum()).collect();
    let entered = reached.first().copied().unwrap_or(0);

    let steps = (0..n)
        .map(|i| {
            let dropped = counts[i + 1];
            let previous = if i == 0 { entered } else { reached[i - 1] };
            FunnelStepResult {
                step: (i + 1) as u32,
                label: funnel.labels[i].clone(),
                reached: reached[i],
                dropped,
                drop_off_rate: ratio(dropped, reached[i]),
                conversion_rate_from_start: ratio(reached[i], entered),
                conversion_rate_from_previous: ratio(reached[i], previous),
            }
        })
        .collect();

    FunnelResult {
        total_sessions_entered: entered,
        final_conversion_rate: ratio(reached.last().copied().unwrap_or(0), entered),
        steps,
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Sessions at a given step: those that reached it, or those that reached it
/// and went no further. `step` is 1-indexed.
pub async fn list_step_sessions(
    scope: ScanScope<'_>,
    request: &ScanRequest,
    predicate: &Predicate,
    funnel: &CompiledFunnel,
    step: u32,
    mode: StepMode,
    window: PageWindow,
) -> Result<Page<SessionListItem>, EngineError> {
    let step_index = step as usize;
    if step_index < 1 || step_index > funnel.len() {
        return Err(EngineError::InvalidFunnel(format!(
            "step {step} is out of range 1..={}",
            funnel.len()
        )));
    }

    let collector = fold_sessions(
        scope,
        request,
        predicate,
        || PageCollector::new(window),
        |collector, run| {
            let depth = funnel.depth(&run.events)?;
            let selected = match mode {
                StepMode::Reached => depth >= step_index,
                StepMode::Dropped => depth == step_index,
            };
            if !selected {
                return Ok(());
            }
            if collector.wants_next() {
                let item = run.summary().list_item(&run, Some(depth as u32));
                collector.push(item);
            } else {
                collector.skip();
            }
            Ok(())
        },
    )
    .await?;
    Ok(collector.finish())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn event(seq: u64, seconds: i64, name: &str, url: Option<&str>) -> Event {
        Event {
            id: format!("e{seq}"),
            site_id: "site_1".to_string(),
            session_id: "s1".to_string(),
            visitor_id: "v1".to_string(),
            name: name.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
                + Duration::seconds(seconds),
            sequence_no: seq,
            properties: Default::default(),
            page_url: url.map(str::to_string),
            referrer: None,
        }
    }

    fn funnel(steps: Vec<FunnelStep>) -> CompiledFunnel {
        CompiledFunnel::compile(&steps, MIN_FUNNEL_STEPS).unwrap()
    }

    #[test]
    fn out_of_order_steps_do_not_count() {
        let f = funnel(vec![FunnelStep::page("/pricing"), FunnelStep::event("signup")]);
        let events = vec![
            event(0, 0, "signup", None),
            event(1, 10, "pageview", Some("/pricing")),
        ];
        assert_eq!(f.depth(&events).unwrap(), 1);
    }

    #[test]
    fn same_timestamp_resolves_by_sequence() {
        let f = funnel(vec![FunnelStep::event("a"), FunnelStep::event("b")]);
        let events = vec![event(0, 0, "a", None), event(1, 0, "b", None)];
        assert_eq!(f.depth(&events).unwrap(), 2);
    }

    #[test]
    fn one_event_advances_one_step() {
        let f = funnel(vec![FunnelStep::event("a"), FunnelStep::event("a")]);
        assert_eq!(f.depth(&[event(0, 0, "a", None)]).unwrap(), 1);
        assert_eq!(f.depth(&[event(0, 0, "a", None), event(1, 5, "a", None)]).unwrap(), 2);
    }

    #[test]
    fn window_is_measured_from_previous_step() {
        let f = funnel(vec![
            FunnelStep::page("/"),
            FunnelStep::event("signup").with_window(60),
        ]);
        let late = vec![
            event(0, 0, "pageview", Some("/")),
            event(1, 61, "signup", None),
        ];
        assert_eq!(f.depth(&late).unwrap(), 1);
        let in_time = vec![
            event(0, 0, "pageview", Some("/")),
            event(1, 60, "signup", None),
        ];
        assert_eq!(f.depth(&in_time).unwrap(), 2);
    }

    #[test]
    fn window_on_first_step_is_ignored() {
        let steps = vec![FunnelStep::page("/").with_window(0), FunnelStep::event("signup")];
        assert!(CompiledFunnel::compile(&steps, MIN_FUNNEL_STEPS).is_ok());
        let zero = vec![FunnelStep::page("/"), FunnelStep::event("signup").with_window(0)];
        assert_eq!(
            CompiledFunnel::compile(&zero, MIN_FUNNEL_STEPS).unwrap_err().kind(),
            "invalid_funnel"
        );
    }

    #[test]
    fn step_count_bounds() {
        let one = vec![FunnelStep::event("a")];
        assert_eq!(CompiledFunnel::compile(&one, MIN_FUNNEL_STEPS).unwrap_err().kind(), "invalid_funnel");
        let nine: Vec<_> = (0..9).map(|i| FunnelStep::event(format!("e{i}"))).collect();
        assert_eq!(CompiledFunnel::compile(&nine, MIN_FUNNEL_STEPS).unwrap_err().kind(), "invalid_funnel");
    }

    #[test]
    fn summarize_matches_reached_and_dropped_definition() {
        let f = funnel(vec![
            FunnelStep::event("a"),
            FunnelStep::event("b"),
            FunnelStep::event("c"),
        ]);
        // 15 stop at step 1, 15 at step 2, 10 finish; 5 never entered.
        let result = summarize(&f, &[5, 15, 15, 10]);
        assert_eq!(result.reached(), vec![40, 25, 10]);
        assert_eq!(result.dropped(), vec![15, 15, 10]);
        assert_eq!(result.total_sessions_entered, 40);
        assert_eq!(result.final_conversion_rate, 0.25);
        assert_eq!(result.steps[1].conversion_rate_from_previous, 0.625);
        assert_eq!(result.steps[0].drop_off_rate, 0.375);
    }

    #[test]
    fn page_steps_ignore_custom_events_on_that_page() {
        let step = CompiledStep::compile(&StepMatcher::Page { path: "/Pricing/".to_string() }).unwrap();
        assert!(step.evaluate(&event(0, 0, "pageview", Some("/pricing?plan=pro"))).unwrap());
        assert!(!step.evaluate(&event(1, 0, "click", Some("/pricing"))).unwrap());
    }
}
