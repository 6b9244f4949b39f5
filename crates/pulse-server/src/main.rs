use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use pulse_core::config::{Config, StoreMode};
use pulse_duckdb::DuckDbBackend;
use pulse_engine::memory::{MemoryRegistry, MemoryStore};
use pulse_server::seed::{default_site, read_events_file, DEFAULT_SITE_ID};
use pulse_server::state::AppState;

/// `pulse health`: liveness probe for Docker HEALTHCHECK.
///
/// Calls `GET http://localhost:$PULSE_PORT/health`.
/// Exits 0 if the server responds with HTTP 200, exits 1 otherwise.
fn run_health_check() -> ! {
    let port = std::env::var("PULSE_PORT").unwrap_or_else(|_| "3000".to_string());
    let url = format!("http://localhost:{}/health", port);
    match ureq::get(&url).call() {
        Ok(resp) if resp.status() == 200 => std::process::exit(0),
        _ => std::process::exit(1),
    }
}

async fn duckdb_state(cfg: Config) -> Result<AppState> {
    // Ensure data directory exists before opening DuckDB.
    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/pulse.db", cfg.data_dir);
    let db = DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit)?;

    // Uses ON CONFLICT, so it's safe to run on every startup.
    db.put_site(&default_site()).await?;
    if let Some(path) = &cfg.seed_path {
        let events = read_events_file(path)?;
        db.insert_events(&events).await?;
        info!(path = %path, count = events.len(), "Seed events loaded");
    }
    Ok(AppState::new(db, cfg))
}

async fn memory_state(cfg: Config) -> Result<AppState> {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(MemoryRegistry::new());
    registry.put_site(default_site()).await;
    if let Some(path) = &cfg.seed_path {
        let events = read_events_file(path)?;
        store.insert_events(&events).await;
        info!(path = %path, count = events.len(), "Seed events loaded");
    }
    tracing::warn!("Memory store selected: data is discarded on exit");
    Ok(AppState::in_memory(store, registry, cfg))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(|s| s.as_str()) == Some("health") {
        run_health_check();
    }
    // Structured JSON logging. Level controlled via RUST_LOG env var.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("pulse=info".parse()?),
        )
        .json()
        .init();

    let cfg = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let state = match cfg.store {
        StoreMode::DuckDb => duckdb_state(cfg.clone()).await?,
        StoreMode::Memory => memory_state(cfg.clone()).await?,
    };
    info!(site_id = DEFAULT_SITE_ID, "Default site ready");

    let addr = format!("0.0.0.0:{}", cfg.port);
    let app = pulse_server::app::build_app(Arc::new(state));

    info!(port = cfg.port, store = ?cfg.store, "Pulse listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
