//! Bounded exponential backoff around store calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use pulse_core::config::EngineLimits;
use pulse_core::error::EngineError;

use crate::context::QueryContext;

/// Delay before retry number `attempt` (0-based): the base doubled per
/// attempt plus up to 50% random jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponential = base.saturating_mul(1u32 << attempt.min(16));
    let jitter: f64 = rand::thread_rng().gen_range(0.0..=0.5);
    exponential.mul_f64(1.0 + jitter)
}

/// Retry state for one store operation.
pub struct Backoff<'a> {
    ctx: &'a QueryContext,
    limits: &'a EngineLimits,
    op: &'static str,
    attempt: u32,
}

impl<'a> Backoff<'a> {
    pub fn new(ctx: &'a QueryContext, limits: &'a EngineLimits, op: &'static str) -> Self {
        Self {
            ctx,
            limits,
            op,
            attempt: 0,
        }
    }

    /// Sleeps before the next attempt when `err` is transient and retries
    /// remain; otherwise hands the error back.
    pub async fn retry_after(&mut self, err: EngineError) -> Result<(), EngineError> {
        let reason = match &err {
            EngineError::StorageUnavailable(reason) => reason.clone(),
            _ => return Err(err),
        };
        if self.attempt >= self.limits.storage_retries {
            tracing::error!(
                query_id = %self.ctx.query_id,
                op = self.op,
                attempts = self.attempt + 1,
                error = %reason,
                "Storage unavailable, giving up"
            );
            return Err(err);
        }

        let delay = backoff_delay(self.limits.retry_base_delay, self.attempt);
        tracing::warn!(
            query_id = %self.ctx.query_id,
            op = self.op,
            attempt = self.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "Storage unavailable, retrying"
        );
        self.attempt += 1;

        tokio::select! {
            _ = self.ctx.token().cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Runs `call` until it succeeds, fails permanently or runs out of retries.
pub async fn with_storage_retry<T, F, Fut>(
    ctx: &QueryContext,
    limits: &EngineLimits,
    op: &'static str,
    mut call: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut backoff = Backoff::new(ctx, limits, op);
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => backoff.retry_after(err).await?,
        }
    }
}
