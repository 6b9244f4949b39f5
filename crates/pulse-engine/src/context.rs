use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use pulse_core::error::EngineError;

/// Per-query execution context: identity for log correlation, a
/// cancellation token shared by every sub-scan, and an optional deadline.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query_id: String,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryContext {
    pub fn new() -> Self {
        Self {
            query_id: uuid::Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Ties the query to an externally owned token, e.g. a request's.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drives `work` until it finishes, the token fires or the deadline
    /// passes. A passed deadline cancels the token so in-flight scans stop.
    pub async fn run<T, F>(&self, work: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            _ = deadline => {
                self.cancel.cancel();
                tracing::info!(query_id = %self.query_id, "Query deadline exceeded");
                Err(EngineError::Cancelled)
            }
            result = work => result,
        }
    }
}
