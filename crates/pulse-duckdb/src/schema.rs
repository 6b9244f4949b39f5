/// DuckDB initialization SQL.
///
/// Executed once at open time via `Connection::execute_batch`. Every
/// statement is `IF NOT EXISTS`, so re-running it on each startup is safe.
///
/// `memory_limit` comes from `Config.duckdb_memory_limit`
/// (env `PULSE_DUCKDB_MEMORY`, default `"1GB"`). Always set an explicit
/// limit: the DuckDB default is 80% of system RAM.
///
/// Event instants are stored as microseconds since the Unix epoch (`ts_us`)
/// so that scans order and compare them without timezone conversion.
/// `properties` holds the event's property map as a JSON object string.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- SITES
-- ===========================================
CREATE TABLE IF NOT EXISTS sites (
    id              VARCHAR PRIMARY KEY,
    name            VARCHAR NOT NULL,
    timezone        VARCHAR(64) NOT NULL DEFAULT 'UTC',  -- IANA timezone string
    public          BOOLEAN NOT NULL DEFAULT FALSE,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- ===========================================
-- EVENTS (raw, append-only)
-- ===========================================
CREATE TABLE IF NOT EXISTS events (
    id              VARCHAR NOT NULL,
    site_id         VARCHAR NOT NULL,
    session_id      VARCHAR NOT NULL,
    visitor_id      VARCHAR NOT NULL,
    name            VARCHAR NOT NULL,              -- 'pageview' or a custom event name
    ts_us           BIGINT NOT NULL,               -- UTC microseconds
    sequence_no     BIGINT NOT NULL DEFAULT 0,     -- tie-break within a session
    page_url        VARCHAR,
    referrer        VARCHAR,
    properties      VARCHAR NOT NULL DEFAULT '{{}}'
);

CREATE INDEX IF NOT EXISTS idx_events_site_time
    ON events(site_id, ts_us);
CREATE INDEX IF NOT EXISTS idx_events_site_session_time
    ON events(site_id, session_id, ts_us, sequence_no);
CREATE INDEX IF NOT EXISTS idx_events_site_name_time
    ON events(site_id, name, ts_us);

-- ===========================================
-- GOALS
-- ===========================================
CREATE TABLE IF NOT EXISTS goals (
    id              VARCHAR NOT NULL,
    site_id         VARCHAR NOT NULL,
    name            VARCHAR NOT NULL,
    goal_type       VARCHAR NOT NULL,              -- 'page_view' | 'event' | 'funnel'
    definition      VARCHAR NOT NULL,              -- JSON GoalDefinition
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (site_id, id)
);
"#
    )
}

/// Tracks applied numbered migrations. Run before [`init_sql`].
pub const MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    id          VARCHAR PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;
