use thiserror::Error;

/// Failure taxonomy of the aggregation engine.
///
/// Validation kinds (`Invalid*`, `TypeMismatch`, `GranularityTooFine`) are
/// raised before any scan starts and are never retried.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid time range: {0}")]
    InvalidRange(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("type mismatch: operator `{operator}` on `{field}` requires a string value")]
    TypeMismatch { field: String, operator: String },

    #[error("invalid funnel: {0}")]
    InvalidFunnel(String),

    #[error("granularity too fine: {buckets} buckets exceeds the limit of {max}")]
    GranularityTooFine { buckets: usize, max: usize },

    #[error("invalid pagination: {0}")]
    InvalidPagination(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Machine-readable error code.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidRange(_) => "invalid_range",
            EngineError::InvalidFilter(_) => "invalid_filter",
            EngineError::TypeMismatch { .. } => "type_mismatch",
            EngineError::InvalidFunnel(_) => "invalid_funnel",
            EngineError::GranularityTooFine { .. } => "granularity_too_fine",
            EngineError::InvalidPagination(_) => "invalid_pagination",
            EngineError::InvalidQuery(_) => "invalid_query",
            EngineError::NotFound(_) => "not_found",
            EngineError::Cancelled => "cancelled",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
            EngineError::Internal(_) => "internal_error",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidRange(_)
                | EngineError::InvalidFilter(_)
                | EngineError::TypeMismatch { .. }
                | EngineError::InvalidFunnel(_)
                | EngineError::GranularityTooFine { .. }
                | EngineError::InvalidPagination(_)
                | EngineError::InvalidQuery(_)
        )
    }
}

/// Errors surfaced by an [`EventStore`](crate::store::EventStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient fault; the engine retries with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store query failed: {0}")]
    Query(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => EngineError::StorageUnavailable(msg),
            StoreError::Query(inner) => EngineError::Internal(inner),
        }
    }
}
