use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::Instrument;

use pulse_core::analytics::{
    AggregateQuery, AggregateResult, FilterExpr, FunnelQuery, FunnelResult, Goal, GoalQuery,
    GoalSessionsQuery, GoalStats, JourneyQuery, JourneyResult, Page, RangeSpec, SessionListItem,
    SiteConfig, StepSessionsQuery, TimeRange,
};
use pulse_core::config::EngineLimits;
use pulse_core::error::EngineError;
use pulse_core::store::{EventStore, ScanRequest, SiteRegistry};

use crate::bucket::resolve_range;
use crate::context::QueryContext;
use crate::filter::{self, Predicate};
use crate::funnel::{self, CompiledFunnel, MIN_FUNNEL_STEPS};
use crate::goals::{self, GoalPlan};
use crate::journey::{self, JourneyPlan};
use crate::metrics;
use crate::pagination::PageWindow;
use crate::retry::with_storage_retry;
use crate::session::ScanScope;

/// Read-only query facade over an event store and a site registry.
///
/// Holds no mutable state; every operation is independent and can run
/// concurrently with any other.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn EventStore>,
    registry: Arc<dyn SiteRegistry>,
    limits: EngineLimits,
}

/// A validated query target: resolved range, scan request and compiled
/// global filters.
struct Prepared {
    range: TimeRange,
    request: ScanRequest,
    predicate: Predicate,
}

impl Engine {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<dyn SiteRegistry>,
        limits: EngineLimits,
    ) -> Self {
        Self {
            store,
            registry,
            limits,
        }
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    fn scope<'a>(&'a self, ctx: &'a QueryContext) -> ScanScope<'a> {
        ScanScope {
            store: self.store.as_ref(),
            ctx,
            limits: &self.limits,
        }
    }

    async fn site(&self, ctx: &QueryContext, site_id: &str) -> Result<SiteConfig, EngineError> {
        with_storage_retry(ctx, &self.limits, "get_site", || async {
            self.registry
                .get_site(site_id)
                .await
                .map_err(EngineError::from)
        })
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("site `{site_id}`")))
    }

    async fn goal(
        &self,
        ctx: &QueryContext,
        site_id: &str,
        goal_id: &str,
    ) -> Result<Goal, EngineError> {
        with_storage_retry(ctx, &self.limits, "get_goal", || async {
            self.registry
                .get_goal(site_id, goal_id)
                .await
                .map_err(EngineError::from)
        })
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("goal `{goal_id}`")))
    }

    async fn prepare(
        &self,
        ctx: &QueryContext,
        site_id: &str,
        range: &RangeSpec,
        filters: &[FilterExpr],
    ) -> Result<Prepared, EngineError> {
        let site = self.site(ctx, site_id).await?;
        let range = resolve_range(range, Some(&site.timezone), Utc::now())?;
        let predicate = filter::compile(filters)?;
        let request =
            ScanRequest::new(site_id, range.start, range.end).with_filters(filters.to_vec());
        Ok(Prepared {
            range,
            request,
            predicate,
        })
    }

    /// Runs `work` under the query's cancellation and deadline, inside a span
    /// carrying the query id, site and operation.
    async fn observe<T, F>(
        &self,
        ctx: &QueryContext,
        op: &'static str,
        site_id: &str,
        work: F,
    ) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let span = tracing::info_span!("query", op, query_id = %ctx.query_id, site_id = %site_id);
        async {
            let started = Instant::now();
            let result = ctx.run(work).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => tracing::debug!(elapsed_ms, "Query finished"),
                Err(EngineError::Cancelled) => tracing::info!(elapsed_ms, "Query cancelled"),
                Err(err) if err.is_validation() || matches!(err, EngineError::NotFound(_)) => {
                    tracing::debug!(kind = err.kind(), error = %err, "Query rejected")
                }
                Err(err) => tracing::warn!(kind = err.kind(), error = %err, elapsed_ms, "Query failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    pub async fn aggregate(
        &self,
        ctx: &QueryContext,
        site_id: &str,
        query: &AggregateQuery,
    ) -> Result<AggregateResult, EngineError> {
        self.observe(ctx, "aggregate", site_id, async {
            let prepared = self.prepare(ctx, site_id, &query.range, &query.filters).await?;
            metrics::aggregate(
                self.scope(ctx),
                &prepared.request,
                &prepared.predicate,
                &prepared.range,
                query,
            )
            .await
        })
        .await
    }

    pub async fn evaluate_funnel(
        &self,
        ctx: &QueryContext,
        site_id: &str,
        query: &FunnelQuery,
    ) -> Result<FunnelResult, EngineError> {
        self.observe(ctx, "evaluate_funnel", site_id, async {
            let compiled = CompiledFunnel::compile(&query.steps, MIN_FUNNEL_STEPS)?;
            let prepared = self.prepare(ctx, site_id, &query.range, &query.filters).await?;
            funnel::evaluate_funnel(
                self.scope(ctx),
                &prepared.request,
                &prepared.predicate,
                &compiled,
            )
            .await
        })
        .await
    }

    pub async fn list_step_sessions(
        &self,
        ctx: &QueryContext,
        site_id: &str,
        query: &StepSessionsQuery,
    ) -> Result<Page<SessionListItem>, EngineError> {
        self.observe(ctx, "list_step_sessions", site_id, async {
            let compiled = CompiledFunnel::compile(&query.steps, MIN_FUNNEL_STEPS)?;
            let window = PageWindow::from_request(&query.page)?;
            let prepared = self.prepare(ctx, site_id, &query.range, &query.filters).await?;
            funnel::list_step_sessions(
                self.scope(ctx),
                &prepared.request,
                &prepared.predicate,
                &compiled,
                query.step,
                query.mode,
                window,
            )
            .await
        })
        .await
    }

    pub async fn build_journeys(
        &self,
        ctx: &QueryContext,
        site_id: &str,
        query: &JourneyQuery,
    ) -> Result<JourneyResult, EngineError> {
        self.observe(ctx, "build_journeys", site_id, async {
            let plan = JourneyPlan::compile(query.max_steps, &query.step_filters, query.limit)?;
            let prepared = self.prepare(ctx, site_id, &query.range, &query.filters).await?;
            journey::build_journeys(
                self.scope(ctx),
                &prepared.request,
                &prepared.predicate,
                &plan,
            )
            .await
        })
        .await
    }

    pub async fn evaluate_goal(
        &self,
        ctx: &QueryContext,
        site_id: &str,
        goal_id: &str,
        query: &GoalQuery,
    ) -> Result<GoalStats, EngineError> {
        self.observe(ctx, "evaluate_goal", site_id, async {
            let goal = self.goal(ctx, site_id, goal_id).await?;
            let plan = GoalPlan::compile(&goal)?;
            let prepared = self.prepare(ctx, site_id, &query.range, &query.filters).await?;
            goals::evaluate_goal(
                self.scope(ctx),
                &goal.id,
                &prepared.request,
                &prepared.predicate,
                &plan,
            )
            .await
        })
        .await
    }

    pub async fn list_goal_sessions(
        &self,
        ctx: &QueryContext,
        site_id: &str,
        goal_id: &str,
        query: &GoalSessionsQuery,
    ) -> Result<Page<SessionListItem>, EngineError> {
        self.observe(ctx, "list_goal_sessions", site_id, async {
            let goal = self.goal(ctx, site_id, goal_id).await?;
            let plan = GoalPlan::compile(&goal)?;
            let window = PageWindow::from_request(&query.page)?;
            let prepared = self.prepare(ctx, site_id, &query.range, &query.filters).await?;
            goals::list_goal_sessions(
                self.scope(ctx),
                &prepared.request,
                &prepared.predicate,
                &plan,
                window,
            )
            .await
        })
        .await
    }
}
