//! Goal conversion: a single predicate or a funnel keyed by a stored goal.

use pulse_core::analytics::{Goal, GoalDefinition, GoalStats, Page, SessionListItem};
use pulse_core::error::EngineError;
use pulse_core::event::Event;
use pulse_core::store::{DistinctField, ScanRequest};

use crate::filter::Predicate;
use crate::funnel::{CompiledFunnel, CompiledStep};
use crate::pagination::{PageCollector, PageWindow};
use crate::retry::with_storage_retry;
use crate::session::{fold_sessions, ScanScope};

#[derive(Debug, Clone)]
pub enum GoalPlan {
    Predicate(CompiledStep),
    Funnel(CompiledFunnel),
}

impl GoalPlan {
    pub fn compile(goal: &Goal) -> Result<Self, EngineError> {
        match &goal.definition {
            GoalDefinition::Predicate { matcher } => {
                Ok(GoalPlan::Predicate(CompiledStep::compile(matcher)?))
            }
            GoalDefinition::Steps { steps } => match steps.as_slice() {
                [] => Err(EngineError::InvalidFunnel(format!(
                    "goal `{}` has no steps",
                    goal.id
                ))),
                [only] => Ok(GoalPlan::Predicate(CompiledStep::compile(&only.matcher)?)),
                _ => Ok(GoalPlan::Funnel(CompiledFunnel::compile(steps, 2)?)),
            },
        }
    }

    /// Steps a converting session has completed.
    fn steps(&self) -> u32 {
        match self {
            GoalPlan::Predicate(_) => 1,
            GoalPlan::Funnel(funnel) => funnel.len() as u32,
        }
    }

    fn converts(&self, events: &[Event]) -> Result<bool, EngineError> {
        match self {
            GoalPlan::Predicate(step) => {
                for event in events {
                    if step.evaluate(event)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            GoalPlan::Funnel(funnel) => Ok(funnel.depth(events)? == funnel.len()),
        }
    }
}

pub async fn evaluate_goal(
    scope: ScanScope<'_>,
    goal_id: &str,
    request: &ScanRequest,
    predicate: &Predicate,
    plan: &GoalPlan,
) -> Result<GoalStats, EngineError> {
    let conversions = fold_sessions(scope, request, predicate, || 0u64, |count, run| {
        if plan.converts(&run.events)? {
            *count += 1;
        }
        Ok(())
    })
    .await?;

    let total_sessions = with_storage_retry(scope.ctx, scope.limits, "count_distinct", || async {
        scope
            .store
            .count_distinct(DistinctField::Session, request)
            .await
            .map_err(EngineError::from)
    })
    .await?;

    Ok(GoalStats {
        goal_id: goal_id.to_string(),
        conversions,
        total_sessions,
        conversion_rate: (total_sessions > 0).then(|| conversions as f64 / total_sessions as f64),
    })
}

pub async fn list_goal_sessions(
    scope: ScanScope<'_>,
    request: &ScanRequest,
    predicate: &Predicate,
    plan: &GoalPlan,
    window: PageWindow,
) -> Result<Page<SessionListItem>, EngineError> {
    let collector = fold_sessions(
        scope,
        request,
        predicate,
        || PageCollector::new(window),
        |collector, run| {
            if !plan.converts(&run.events)? {
                return Ok(());
            }
            if collector.wants_next() {
                let item = run.summary().list_item(&run, Some(plan.steps()));
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
