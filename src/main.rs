// ─────────────────────────────────────────────────────────────────────────────
// bitget-engine-rs: scalping + grid trading engine
//
// Wiring order matters: database pool and migrations first, then the
// process-scoped handles (exchange client, spec cache, persistence worker),
// then the strategy manager. The engine resumes the last persisted strategy
// config if one exists and runs until SIGINT.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use bitget_engine_rs::error::{EngineError, Result};
use bitget_engine_rs::exchange::BitgetClient;
use bitget_engine_rs::instruments::SpecCache;
use bitget_engine_rs::manager::StrategyManager;
use bitget_engine_rs::persistence::PersistenceWorker;
use bitget_engine_rs::signing::ApiCredentials;

#[tokio::main]
async fn main() {
    // Load .env if present (silently ignored if missing).
    dotenvy::dotenv().ok();
    init_logging();

    if let Err(e) = run().await {
        log::error!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let level = match std::env::var("LOG_LEVEL").unwrap_or_default().to_uppercase().as_str() {
        "DEBUG" => log::LevelFilter::Debug,
        "WARN" => log::LevelFilter::Warn,
        "ERROR" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EngineError::Validation(format!("{} must be set", key)))
}

/// DATABASE_URL wins; otherwise the POSTGRES_* tuple is assembled.
fn database_url() -> Result<String> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return Ok(url);
    }
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".into());
    let user = required_env("POSTGRES_USER")?;
    let password = required_env("POSTGRES_PASSWORD")?;
    let db = required_env("POSTGRES_DB")?;
    Ok(format!("postgres://{}:{}@{}:{}/{}", user, password, host, port, db))
}

async fn run() -> Result<()> {
    log::info!("bitget-engine-rs starting…");

    let credentials = ApiCredentials {
        api_key: required_env("BITGET_API_KEY")?,
        secret_key: required_env("BITGET_SECRET_KEY")?,
        passphrase: required_env("BITGET_PASSPHRASE")?,
    };
    let base_url = std::env::var("BITGET_API_BASE_URL").ok();
    let simulated = std::env::var("BITGET_SIMULATED").map(|v| v == "1").unwrap_or(false);
    if simulated {
        log::warn!("papertrading mode: every request carries the sandbox header");
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url()?)
        .await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| EngineError::Persistence(format!("migrations failed: {}", e)))?;
    log::info!("database ready, migrations applied");

    let client = Arc::new(BitgetClient::new(credentials, base_url, simulated));
    let specs = Arc::new(SpecCache::new(client.clone(), pool.clone()));
    let (persistence, persistence_task) = PersistenceWorker::spawn(pool);
    let manager = StrategyManager::new(client, specs, persistence.clone());

    match manager.resume_from_persisted().await {
        Ok(Some(state)) => log::info!(
            "resumed strategy on {} (status {:?})",
            state.symbol.as_deref().unwrap_or("?"),
            state.status
        ),
        Ok(None) => log::info!("no persisted strategy config; engine is idle"),
        Err(e) => log::warn!("could not resume persisted strategy: {}", e),
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| EngineError::Validation(format!("signal handler: {}", e)))?;
    log::info!("SIGINT received, shutting down");

    if let Err(e) = manager.stop_active().await {
        log::warn!("stop on shutdown reported: {}", e);
    }

    persistence.request_shutdown();
    if tokio::time::timeout(std::time::Duration::from_secs(10), persistence_task)
        .await
        .is_err()
    {
        log::warn!("persistence queue did not drain within 10s");
    }

    log::info!("bye");
    Ok(())
}
