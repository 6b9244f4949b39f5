//! Journey reconstruction: per-session label sequences grouped into ranked
//! paths and a prefix tree.

use std::collections::{BTreeMap, HashMap};

use pulse_core::analytics::{FilterExpr, JourneyBranch, JourneyPath, JourneyResult};
use pulse_core::error::EngineError;
use pulse_core::event::Event;
use pulse_core::store::ScanRequest;

use crate::filter::{self, Predicate};
use crate::paths::journey_label;
use crate::session::{fold_sessions, ScanScope};

pub const MAX_JOURNEY_STEPS: u32 = 10;
pub const DEFAULT_PATH_LIMIT: u32 = 20;
pub const MAX_PATH_LIMIT: u32 = 200;

/// Validated journey parameters.
#[derive(Debug, Clone)]
pub struct JourneyPlan {
    max_steps: usize,
    /// Position-indexed; position 0 anchors, later positions constrain.
    step_filters: Vec<Option<Predicate>>,
    limit: usize,
}

impl JourneyPlan {
    pub fn compile(
        max_steps: u32,
        step_filters: &[Option<Vec<FilterExpr>>],
        limit: Option<u32>,
    ) -> Result<Self, EngineError> {
        if !(1..=MAX_JOURNEY_STEPS).contains(&max_steps) {
            return Err(EngineError::InvalidQuery(format!(
                "max_steps must be between 1 and {MAX_JOURNEY_STEPS}, got {max_steps}"
            )));
        }
        if step_filters.len() > max_steps as usize {
            return Err(EngineError::InvalidQuery(format!(
                "{} step filters given for {max_steps} steps",
                step_filters.len()
            )));
        }
        let limit = match limit {
            Some(0) => {
                return Err(EngineError::InvalidQuery(
                    "limit must be at least 1".to_string(),
                ))
            }
            Some(n) => n.min(MAX_PATH_LIMIT),
            None => DEFAULT_PATH_LIMIT,
        };

        let step_filters = step_filters
            .iter()
            .map(|slot| match slot {
                Some(exprs) if !exprs.is_empty() => filter::compile(exprs).map(Some),
                _ => Ok(None),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            max_steps: max_steps as usize,
            step_filters,
            limit: limit as usize,
        })
    }

    fn step_filter(&self, position: usize) -> Option<&Predicate> {
        self.step_filters.get(position).and_then(Option::as_ref)
    }

    /// The labelled path of one session, `None` when the session has no
    /// qualifying event or never matches the anchor.
    pub fn path(&self, events: &[Event]) -> Result<Option<Vec<String>>, EngineError> {
        let mut labelled = events
            .iter()
            .filter_map(|e| journey_label(e).map(|label| (e, label)));

        let first = match self.step_filter(0) {
            Some(anchor) => {
                let mut found = None;
                for (event, label) in labelled.by_ref() {
                    if anchor.evaluate(event)? {
                        found = Some(label);
                        break;
                    }
                }
                found
            }
            None => labelled.next().map(|(_, label)| label),
        };
        let Some(first) = first else {
            return Ok(None);
        };

        let mut path = Vec::with_capacity(self.max_steps);
        path.push(first);
        for position in 1..self.max_steps {
            let Some((event, label)) = labelled.next() else {
                break;
            };
            if let Some(constraint) = self.step_filter(position) {
                if !constraint.evaluate(event)? {
                    break;
                }
            }
            path.push(label);
        }
        Ok(Some(path))
    }
}

#[derive(Debug, Default)]
struct TreeNode {
    sessions: u64,
    exits: u64,
    children: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    fn insert(&mut self, path: &[String], count: u64) {
        let mut node = self;
        for label in path {
            node = node.children.entry(label.clone()).or_default();
            node.sessions += count;
        }
        node.exits += count;
    }

    fn into_branches(self) -> Vec<JourneyBranch> {
        let mut branches: Vec<JourneyBranch> = self
            .children
            .into_iter()
            .map(|(label, child)| JourneyBranch {
                label,
                sessions: child.sessions,
                exits: child.exits,
                children: child.into_branches(),
            })
            .collect();
        // BTreeMap order already breaks ties by label.
        branches.sort_by(|a, b| b.sessions.cmp(&a.sessions));
        branches
    }
}

pub async fn build_journeys(
    scope: ScanScope<'_>,
    request: &ScanRequest,
    predicate: &Predicate,
    plan: &JourneyPlan,
) -> Result<JourneyResult, EngineError> {
    let counts = fold_sessions(
        scope,
        request,
        predicate,
        HashMap::<Vec<String>, u64>::new,
        |counts, run| {
            if let Some(path) = plan.path(&run.events)? {
                *counts.entry(path).or_default() += 1;
            }
            Ok(())
        },
    )
    .await?;
    Ok(rank(counts, plan))
}

/// Ranks paths by count descending, then lexicographically.
fn rank(counts: HashMap<Vec<String>, u64>, plan: &JourneyPlan) -> JourneyResult {
    let total_sessions: u64 = counts.values().sum();
    let total_paths = counts.len() as u64;

    let mut ranked: Vec<(Vec<String>, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut tree = TreeNode::default();
    for (path, count) in &ranked {
        tree.insert(path, *count);
    }

    let paths = ranked
        .into_iter()
        .take(plan.limit)
        .map(|(path, count)| JourneyPath {
            path,
            count,
            share: if total_sessions == 0 {
                0.0
            } else {
                count as f64 / total_sessions as f64
            },
        })
        .collect();

    JourneyResult {
        max_steps: plan.max_steps as u32,
        total_sessions,
        total_paths,
        paths,
        branches: tree.into_branches(),
    }
}
