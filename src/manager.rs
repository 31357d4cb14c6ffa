// ─────────────────────────────────────────────────────────────────────────────
// manager.rs — strategy lifecycle
//
// Holds at most one active strategy instance for the process. The manager
// never touches the exchange or the tracker itself; it builds the service
// triple, constructs the engine variant and owns the instance reference. A
// watchdog bounds stop() so a hung engine cannot block the caller; ERROR
// instances stay reachable through emergency_stop.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::{ConfigManager, StrategyConfig, StrategyKind};
use crate::error::{EngineError, Result};
use crate::events::StrategyEvent;
use crate::exchange::BitgetClient;
use crate::grid::GridEngine;
use crate::instruments::SpecCache;
use crate::persistence::PersistenceWorker;
use crate::scalping::ScalpEngine;
use crate::services::build_services;

const STOP_WATCHDOG_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Serializable snapshot of an engine, rendered by the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineState {
    pub status: EngineStatus,
    pub strategy_type: Option<StrategyKind>,
    pub instance_id: Option<String>,
    pub symbol: Option<String>,
    pub realized_pnl: f64,
    pub daily_pnl: f64,
    pub total_trades: u64,
    pub win_trades: u64,
    pub loss_trades: u64,
    pub pending_buys: usize,
    pub pending_sells: usize,
    pub position_notional: f64,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub cooling_until: Option<i64>,
}

impl EngineState {
    /// The canonical answer when nothing is running.
    pub fn stopped() -> Self {
        Self {
            status: EngineStatus::Stopped,
            strategy_type: None,
            instance_id: None,
            symbol: None,
            realized_pnl: 0.0,
            daily_pnl: 0.0,
            total_trades: 0,
            win_trades: 0,
            loss_trades: 0,
            pending_buys: 0,
            pending_sells: 0,
            position_notional: 0.0,
            error_count: 0,
            last_error: None,
            cooling_until: None,
        }
    }
}

/// What every strategy engine exposes to the manager.
#[async_trait::async_trait]
pub trait StrategyEngine: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn emergency_stop(&self) -> Result<()>;
    async fn update_config(&self, partial: &Value) -> Result<StrategyConfig>;
    fn status(&self) -> EngineStatus;
    fn state(&self) -> EngineState;
    fn events(&self, limit: usize) -> Vec<StrategyEvent>;
    fn config(&self) -> StrategyConfig;
}

pub struct StrategyManager {
    client: Arc<BitgetClient>,
    specs: Arc<SpecCache>,
    persistence: PersistenceWorker,
    active: tokio::sync::Mutex<Option<Arc<dyn StrategyEngine>>>,
}

impl StrategyManager {
    pub fn new(
        client: Arc<BitgetClient>,
        specs: Arc<SpecCache>,
        persistence: PersistenceWorker,
    ) -> Self {
        Self {
            client,
            specs,
            persistence,
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Builds, wires and starts a strategy from config overrides. The
    /// `strategy_type` key selects the variant (default scalping).
    pub async fn create_and_start(&self, overrides: &Value) -> Result<EngineState> {
        let mut active = self.active.lock().await;
        if let Some(engine) = active.as_ref() {
            if matches!(engine.status(), EngineStatus::Starting | EngineStatus::Running) {
                return Err(EngineError::AlreadyRunning);
            }
        }

        let kind = match overrides["strategy_type"].as_str() {
            Some("grid") => StrategyKind::Grid,
            Some("scalping") | None => StrategyKind::Scalping,
            Some(other) => {
                return Err(EngineError::ConfigInvalid(format!(
                    "unknown strategy_type `{}`",
                    other
                )))
            }
        };
        let config = ConfigManager::new(kind, overrides)?;
        let services = build_services(self.client.clone(), config.get().base()).await;

        let engine: Arc<dyn StrategyEngine> = match kind {
            StrategyKind::Scalping => Arc::new(ScalpEngine::new(
                services,
                self.specs.clone(),
                self.persistence.clone(),
                config,
            )?),
            StrategyKind::Grid => Arc::new(GridEngine::new(
                services,
                self.specs.clone(),
                self.persistence.clone(),
                config,
            )?),
        };

        engine.start().await?;

        if let Ok(config_json) = serde_json::to_value(engine.config()) {
            self.persistence.save_active_config(config_json);
        }

        let state = engine.state();
        *active = Some(engine);
        log::info!(
            "[MANAGER] started {} strategy on {}",
            kind.as_str(),
            state.symbol.as_deref().unwrap_or("?")
        );
        Ok(state)
    }

    /// Stops the active instance. A no-op when nothing runs; a hung stop is
    /// abandoned after the watchdog elapses so the caller always returns.
    pub async fn stop_active(&self) -> Result<EngineState> {
        let mut active = self.active.lock().await;
        let Some(engine) = active.take() else {
            return Ok(EngineState::stopped());
        };
        match tokio::time::timeout(
            std::time::Duration::from_secs(STOP_WATCHDOG_SECS),
            engine.stop(),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("[MANAGER] stop reported: {}", e),
            Err(_) => log::error!(
                "[MANAGER] stop did not complete within {}s, instance abandoned",
                STOP_WATCHDOG_SECS
            ),
        }
        Ok(engine.state())
    }

    /// Cancels everything immediately, bypassing the STOPPING path; works
    /// from ERROR as well.
    pub async fn emergency_stop_active(&self) -> Result<EngineState> {
        let mut active = self.active.lock().await;
        let Some(engine) = active.take() else {
            return Ok(EngineState::stopped());
        };
        match tokio::time::timeout(
            std::time::Duration::from_secs(STOP_WATCHDOG_SECS),
            engine.emergency_stop(),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("[MANAGER] emergency stop reported: {}", e),
            Err(_) => log::error!("[MANAGER] emergency stop timed out, instance abandoned"),
        }
        Ok(engine.state())
    }

    pub async fn state(&self) -> EngineState {
        match self.active.lock().await.as_ref() {
            Some(engine) => engine.state(),
            None => EngineState::stopped(),
        }
    }

    pub async fn events(&self, limit: usize) -> Vec<StrategyEvent> {
        match self.active.lock().await.as_ref() {
            Some(engine) => engine.events(limit),
            None => Vec::new(),
        }
    }

    pub async fn update_active_config(&self, partial: &Value) -> Result<StrategyConfig> {
        match self.active.lock().await.as_ref() {
            Some(engine) => engine.update_config(partial).await,
            None => Err(EngineError::NotRunning),
        }
    }

    /// Restores the persisted config, if any, and starts it.
    pub async fn resume_from_persisted(&self) -> Result<Option<EngineState>> {
        let Some(config) = self.persistence.load_active_config().await? else {
            return Ok(None);
        };
        log::info!(
            "[MANAGER] resuming persisted strategy: {}",
            config["strategy_type"].as_str().unwrap_or("scalping")
        );
        let state = self.create_and_start(&config).await?;
        Ok(Some(state))
    }
}

/// Helper used by status surfaces to render a state as JSON.
pub fn state_json(state: &EngineState) -> Value {
    serde_json::to_value(state).unwrap_or_else(|_| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::ApiCredentials;
    use serde_json::json;

    fn offline_manager() -> StrategyManager {
        let creds = ApiCredentials {
            api_key: "k".into(),
            secret_key: "s".into(),
            passphrase: "p".into(),
        };
        let client = Arc::new(BitgetClient::new(creds, Some("http://127.0.0.1:1".into()), true));
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(100))
            .connect_lazy("postgres://u:p@127.0.0.1:1/none")
            .unwrap();
        let specs = Arc::new(SpecCache::new(client.clone(), pool.clone()));
        let (persistence, _handle) = PersistenceWorker::spawn(pool);
        StrategyManager::new(client, specs, persistence)
    }

    #[tokio::test]
    async fn test_idle_manager_reports_stopped() {
        let manager = offline_manager();
        let state = manager.state().await;
        assert_eq!(state.status, EngineStatus::Stopped);
        assert!(state.symbol.is_none());
        assert!(manager.events(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_a_noop() {
        let manager = offline_manager();
        let state = manager.stop_active().await.unwrap();
        assert_eq!(state.status, EngineStatus::Stopped);
        let state = manager.emergency_stop_active().await.unwrap();
        assert_eq!(state.status, EngineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_overrides_rejected_before_start() {
        let manager = offline_manager();
        let err = manager.create_and_start(&json!({"symbol": ""})).await.unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));

        let err = manager
            .create_and_start(&json!({"symbol": "BTCUSDT", "strategy_type": "martingale"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn test_failed_start_leaves_manager_idle() {
        // The exchange endpoint is unreachable, so start fails while loading
        // the instrument spec; no active instance may linger.
        let manager = offline_manager();
        let result = manager
            .create_and_start(&json!({"symbol": "BTCUSDT", "price_spread": 1.0}))
            .await;
        assert!(result.is_err());
        assert_eq!(manager.state().await.status, EngineStatus::Stopped);
        assert!(manager
            .update_active_config(&json!({"notional": 20.0}))
            .await
            .is_err());
    }
}
