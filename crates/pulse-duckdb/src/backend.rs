use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use duckdb::Connection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use pulse_core::error::StoreError;
use pulse_core::event::Event;

use crate::schema::{init_sql, MIGRATIONS_TABLE_SQL};

/// How long a query waits for the connection before the store reports
/// itself unavailable.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_MIGRATION: &str = "0001_initial";

/// A DuckDB-backed event store and site/goal registry.
///
/// DuckDB is single-writer. The connection lives behind `Arc<Mutex<_>>` so
/// scans, counts and inserts serialise through one lock while the backend
/// stays cheap to share across handlers. Scans take the lock once per batch,
/// never for the whole stream.
///
/// Memory and thread limits are enforced by [`init_sql`] at open time.
pub struct DuckDbBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl DuckDbBackend {
    /// Open (or create) a DuckDB database file at `path`.
    ///
    /// `memory_limit` is a DuckDB size string such as `"1GB"` or `"512MB"`.
    pub fn open(path: &str, memory_limit: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn, memory_limit)?;
        info!(
            "DuckDB opened at {} with memory_limit={}, threads=2",
            path, memory_limit
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an **in-memory** DuckDB database. Data is discarded on drop.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn, "1GB")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection, memory_limit: &str) -> Result<()> {
        conn.execute_batch(MIGRATIONS_TABLE_SQL)?;
        conn.execute_batch(&init_sql(memory_limit))?;
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (id) VALUES (?1)",
            duckdb::params![INITIAL_MIGRATION],
        )?;
        Ok(())
    }

    /// Acquire the connection for a store call, or report the store
    /// unavailable once [`LOCK_TIMEOUT`] passes.
    pub(crate) async fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        tokio::time::timeout(LOCK_TIMEOUT, self.conn.lock())
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "DuckDB connection busy for more than {}ms",
                    LOCK_TIMEOUT.as_millis()
                ))
            })
    }

    /// Insert a batch of events in a single transaction.
    ///
    /// Returns immediately (no-op) if `events` is empty.
    pub async fn insert_events(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;

        // One transaction per batch: one fsync instead of N.
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"INSERT INTO events (
                    id, site_id, session_id, visitor_id, name,
                    ts_us, sequence_no, page_url, referrer, properties
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            )?;
            for event in events {
                let properties = serde_json::to_string(&event.properties)?;
                stmt.execute(duckdb::params![
                    event.id,
                    event.site_id,
                    event.session_id,
                    event.visitor_id,
                    event.name,
                    event.timestamp.timestamp_micros(),
                    i64::try_from(event.sequence_no)?,
                    event.page_url,
                    event.referrer,
                    properties,
                ])?;
            }
        }
        tx.commit()?;
        tracing::info!("Inserted {} events into DuckDB", events.len());
        Ok(())
    }

    /// Execute `SELECT 1` as a lightweight liveness check.
    ///
    /// Called by the `/health` endpoint.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.lock().await?;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Acquire the DuckDB connection lock for direct queries.
    ///
    /// Intended for integration tests that need to verify stored data.
    pub async fn conn_for_test(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
