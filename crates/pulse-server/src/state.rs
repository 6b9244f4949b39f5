use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

use pulse_core::config::Config;
use pulse_duckdb::DuckDbBackend;
use pulse_engine::memory::{MemoryRegistry, MemoryStore};
use pulse_engine::{Engine, QueryContext};

use crate::error::AppError;

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
pub struct AppState {
    /// Query facade over the store chosen at startup.
    pub engine: Engine,

    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,

    /// The DuckDB backend when `PULSE_STORE=duckdb`; probed by `/health`.
    pub db: Option<Arc<DuckDbBackend>>,

    /// Bounds concurrent heavy queries across all requests.
    query_slots: Semaphore,
}

impl AppState {
    /// State serving queries from a DuckDB database.
    pub fn new(db: DuckDbBackend, config: Config) -> Self {
        let db = Arc::new(db);
        let engine = Engine::new(db.clone(), db.clone(), config.engine_limits());
        Self::with_engine(engine, Some(db), config)
    }

    /// State serving queries from process-local memory.
    pub fn in_memory(store: Arc<MemoryStore>, registry: Arc<MemoryRegistry>, config: Config) -> Self {
        let engine = Engine::new(store, registry, config.engine_limits());
        Self::with_engine(engine, None, config)
    }

    pub fn with_engine(engine: Engine, db: Option<Arc<DuckDbBackend>>, config: Config) -> Self {
        Self {
            engine,
            db,
            query_slots: Semaphore::new(config.query_concurrency.max(1)),
            config: Arc::new(config),
        }
    }

    /// Wait for a query slot, giving up after the query timeout.
    pub async fn acquire_query_slot(&self) -> Result<SemaphorePermit<'_>, AppError> {
        match tokio::time::timeout(self.config.query_timeout(), self.query_slots.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(closed)) => Err(AppError::Internal(closed.into())),
            Err(_) => {
                tracing::warn!(
                    limit = self.config.query_concurrency,
                    "Query queue wait timed out"
                );
                Err(AppError::Overloaded)
            }
        }
    }

    /// A fresh context carrying the configured per-query deadline.
    pub fn query_context(&self) -> QueryContext {
        QueryContext::new().with_timeout(self.config.query_timeout())
    }

    /// Liveness of the underlying store. The memory store is always up.
    pub async fn ping(&self) -> anyhow::Result<()> {
        match &self.db {
            Some(db) => db.ping().await,
            None => Ok(()),
        }
    }
}
