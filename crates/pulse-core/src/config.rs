use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    pub duckdb_memory_limit: String,
    pub store: StoreMode,
    pub cors_origins: Vec<String>,
    pub max_buckets: usize,
    pub group_top_k: usize,
    pub scan_concurrency: usize,
    pub query_concurrency: usize,
    pub query_timeout_ms: u64,
    pub storage_retries: u32,
    pub retry_base_ms: u64,
    /// Newline-delimited JSON events loaded into the store at startup.
    pub seed_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreMode {
    DuckDb,
    /// Process-local store, discarded on exit. Useful for demos and tests.
    Memory,
}

/// Limits the engine enforces on every query.
#[derive(Debug, Clone)]
pub struct EngineLimits {
    /// Ceiling on buckets per series before `GranularityTooFine`.
    pub max_buckets: usize,
    /// Group-by values kept per series; the rest fold into `"other"`.
    pub group_top_k: usize,
    /// Concurrent store scans per query.
    pub scan_concurrency: usize,
    pub storage_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_buckets: 1000,
            group_top_k: 10,
            scan_concurrency: 4,
            storage_retries: 3,
            retry_base_delay: Duration::from_millis(50),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let defaults = EngineLimits::default();
        Ok(Self {
            port: std::env::var("PULSE_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|e| format!("invalid port: {e}"))?,
            data_dir: std::env::var("PULSE_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            duckdb_memory_limit: std::env::var("PULSE_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "1GB".to_string()),
            store: {
                let raw = std::env::var("PULSE_STORE").unwrap_or_else(|_| "duckdb".to_string());
                match raw.as_str() {
                    "memory" => StoreMode::Memory,
                    "duckdb" => StoreMode::DuckDb,
                    other => return Err(format!("invalid PULSE_STORE: {other}")),
                }
            },
            cors_origins: std::env::var("PULSE_CORS_ORIGINS")
                .map(|v| v.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            max_buckets: env_or("PULSE_MAX_BUCKETS", defaults.max_buckets),
            group_top_k: env_or("PULSE_GROUP_TOP_K", defaults.group_top_k),
            scan_concurrency: env_or("PULSE_SCAN_CONCURRENCY", defaults.scan_concurrency).max(1),
            query_concurrency: env_or("PULSE_QUERY_CONCURRENCY", 4usize).max(1),
            query_timeout_ms: env_or("PULSE_QUERY_TIMEOUT_MS", 10_000),
            storage_retries: env_or("PULSE_STORAGE_RETRIES", defaults.storage_retries),
            retry_base_ms: env_or("PULSE_RETRY_BASE_MS", 50),
            seed_path: std::env::var("PULSE_SEED_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty()),
        })
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn engine_limits(&self) -> EngineLimits {
        EngineLimits {
            max_buckets: self.max_buckets,
            group_top_k: self.group_top_k,
            scan_concurrency: self.scan_concurrency,
            storage_retries: self.storage_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_ms),
        }
    }
}
