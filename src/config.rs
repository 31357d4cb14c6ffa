// ─────────────────────────────────────────────────────────────────────────────
// config.rs — strategy configuration
//
// A tagged sum over a shared base: the `strategy_type` field selects the
// scalping or grid variant. The config manager owns the mutable copy;
// updates are merged, re-validated and rolled back atomically, and a small
// key set is frozen while the strategy is running.
// ─────────────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::instruments::{VenueKind, PRODUCT_TYPE_USDT_FUTURES};
use crate::tracker::TradeDirection;

/// Keys that cannot change on a running instance.
pub const IMMUTABLE_KEYS: [&str; 7] = [
    "symbol",
    "strategy_type",
    "trading_type",
    "margin_mode",
    "margin_coin",
    "product_type",
    "instance_id",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Scalping,
    Grid,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Scalping => "scalping",
            StrategyKind::Grid => "grid",
        }
    }
}

/// Whether the derivatives account runs hedge mode (independent long/short,
/// orders must carry tradeSide) or one-way mode (tradeSide omitted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldMode {
    SingleHold,
    DoubleHold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridKind {
    Arithmetic,
    Geometric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseConfig {
    pub instance_id: String,
    pub symbol: String,
    pub trading_type: VenueKind,
    /// Target notional per order, quote currency.
    pub notional: f64,
    pub max_position: f64,
    pub max_drawdown_percent: f64,
    pub stop_loss_percent: f64,
    pub max_daily_loss: f64,
    pub cooldown_ms: i64,
    /// Overridden from the instrument spec at strategy start.
    pub price_precision: u32,
    pub size_precision: u32,
    pub poll_interval_ms: u64,
    pub order_check_interval_ms: u64,
    // Derivatives-only; ignored by spot adapters.
    pub product_type: Option<String>,
    pub margin_mode: Option<String>,
    pub margin_coin: Option<String>,
    pub leverage: Option<u32>,
    pub direction: Option<TradeDirection>,
    /// Skips hold-mode detection entirely when set — needed for live
    /// one-way accounts, where the double_hold fallback payload is rejected.
    pub position_mode_override: Option<HoldMode>,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            symbol: String::new(),
            trading_type: VenueKind::Derivatives,
            notional: 10.0,
            max_position: 100.0,
            max_drawdown_percent: 5.0,
            stop_loss_percent: 3.0,
            max_daily_loss: 50.0,
            cooldown_ms: 60_000,
            price_precision: 2,
            size_precision: 4,
            poll_interval_ms: 1000,
            order_check_interval_ms: 2000,
            product_type: Some(PRODUCT_TYPE_USDT_FUTURES.to_string()),
            margin_mode: Some("crossed".to_string()),
            margin_coin: Some("USDT".to_string()),
            leverage: Some(10),
            direction: Some(TradeDirection::Long),
            position_mode_override: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalpingConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    /// Arithmetic offset between a buy's fill price and its paired sell.
    pub price_spread: f64,
    pub max_pending_orders: usize,
    pub merge_threshold: usize,
}

impl Default for ScalpingConfig {
    fn default() -> Self {
        Self {
            base: BaseConfig::default(),
            price_spread: 1.0,
            max_pending_orders: 200,
            merge_threshold: 21,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    pub upper_price: f64,
    pub lower_price: f64,
    pub grid_count: usize,
    pub grid_type: GridKind,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            base: BaseConfig::default(),
            upper_price: 0.0,
            lower_price: 0.0,
            grid_count: 10,
            grid_type: GridKind::Arithmetic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy_type", rename_all = "lowercase")]
pub enum StrategyConfig {
    Scalping(ScalpingConfig),
    Grid(GridConfig),
}

impl StrategyConfig {
    pub fn kind(&self) -> StrategyKind {
        match self {
            StrategyConfig::Scalping(_) => StrategyKind::Scalping,
            StrategyConfig::Grid(_) => StrategyKind::Grid,
        }
    }

    pub fn base(&self) -> &BaseConfig {
        match self {
            StrategyConfig::Scalping(c) => &c.base,
            StrategyConfig::Grid(c) => &c.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseConfig {
        match self {
            StrategyConfig::Scalping(c) => &mut c.base,
            StrategyConfig::Grid(c) => &mut c.base,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let base = self.base();
        if base.symbol.trim().is_empty() {
            return Err(EngineError::ConfigInvalid("symbol must not be empty".into()));
        }
        if base.notional <= 0.0 {
            return Err(EngineError::ConfigInvalid("notional must be > 0".into()));
        }
        if base.max_position <= 0.0 {
            return Err(EngineError::ConfigInvalid("max_position must be > 0".into()));
        }
        if base.trading_type == VenueKind::Derivatives {
            let leverage = base.leverage.unwrap_or(0);
            if !(1..=125).contains(&leverage) {
                return Err(EngineError::ConfigInvalid("leverage must be in [1, 125]".into()));
            }
        }
        if base.poll_interval_ms < 200 {
            return Err(EngineError::ConfigInvalid("poll_interval_ms must be >= 200".into()));
        }
        if base.order_check_interval_ms < 500 {
            return Err(EngineError::ConfigInvalid("order_check_interval_ms must be >= 500".into()));
        }
        if !(base.max_drawdown_percent > 0.0 && base.max_drawdown_percent <= 100.0) {
            return Err(EngineError::ConfigInvalid("max_drawdown_percent must be in (0, 100]".into()));
        }
        if base.cooldown_ms < 0 {
            return Err(EngineError::ConfigInvalid("cooldown_ms must be >= 0".into()));
        }
        if base.price_precision > 8 || base.size_precision > 8 {
            return Err(EngineError::ConfigInvalid("precisions must be in [0, 8]".into()));
        }
        match self {
            StrategyConfig::Scalping(c) => {
                if c.price_spread <= 0.0 {
                    return Err(EngineError::ConfigInvalid("price_spread must be > 0".into()));
                }
                if !(1..=500).contains(&c.max_pending_orders) {
                    return Err(EngineError::ConfigInvalid("max_pending_orders must be in [1, 500]".into()));
                }
                if c.merge_threshold < 2 || c.merge_threshold > c.max_pending_orders {
                    return Err(EngineError::ConfigInvalid(
                        "merge_threshold must be in [2, max_pending_orders]".into(),
                    ));
                }
            }
            StrategyConfig::Grid(c) => {
                if !(2..=200).contains(&c.grid_count) {
                    return Err(EngineError::ConfigInvalid("grid_count must be in [2, 200]".into()));
                }
                if c.upper_price != 0.0 && c.lower_price != 0.0 && c.upper_price <= c.lower_price {
                    return Err(EngineError::ConfigInvalid("upper_price must exceed lower_price".into()));
                }
            }
        }
        Ok(())
    }
}

/// Recursive merge: objects merge key-by-key, everything else replaces.
pub fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                merge_json(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (t, p) => *t = p.clone(),
    }
}

/// Owns the mutable config for one strategy instance.
#[derive(Debug)]
pub struct ConfigManager {
    current: StrategyConfig,
}

impl ConfigManager {
    /// Variant default + overrides, then validation.
    pub fn new(kind: StrategyKind, overrides: &Value) -> Result<Self> {
        if !overrides.is_object() {
            return Err(EngineError::ConfigInvalid(
                "config overrides must be a JSON object".into(),
            ));
        }
        let default = match kind {
            StrategyKind::Scalping => StrategyConfig::Scalping(ScalpingConfig::default()),
            StrategyKind::Grid => StrategyConfig::Grid(GridConfig::default()),
        };
        let mut json = serde_json::to_value(&default)
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        merge_json(&mut json, overrides);
        // The tag always comes from the chosen variant.
        json["strategy_type"] = Value::String(kind.as_str().to_string());
        let config: StrategyConfig = serde_json::from_value(json)
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(Self { current: config })
    }

    pub fn from_config(config: StrategyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { current: config })
    }

    pub fn get(&self) -> &StrategyConfig {
        &self.current
    }

    pub fn snapshot(&self) -> StrategyConfig {
        self.current.clone()
    }

    /// Applies a partial update. While running, the frozen key set is
    /// rejected; an update that fails validation leaves the previous config
    /// in place.
    pub fn update(&mut self, partial: &Value, running: bool) -> Result<StrategyConfig> {
        if running {
            if let Value::Object(patch) = partial {
                let current_json = serde_json::to_value(&self.current)
                    .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
                for key in IMMUTABLE_KEYS {
                    if let Some(v) = patch.get(key) {
                        if current_json.get(key) != Some(v) {
                            return Err(EngineError::ConfigImmutableKey(key.to_string()));
                        }
                    }
                }
            }
        }
        let mut candidate_json = serde_json::to_value(&self.current)
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        merge_json(&mut candidate_json, partial);
        let candidate: StrategyConfig = serde_json::from_value(candidate_json)
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        candidate.validate()?;
        self.current = candidate;
        Ok(self.current.clone())
    }

    /// The instrument spec wins over whatever precision the user supplied.
    pub fn apply_spec_precision(&mut self, price_place: u32, volume_place: u32) {
        let base = self.current.base_mut();
        base.price_precision = price_place;
        base.size_precision = volume_place;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scalping_overrides() -> Value {
        json!({
            "symbol": "BTCUSDT",
            "notional": 10.0,
            "price_spread": 2.0,
        })
    }

    #[test]
    fn test_defaults_plus_overrides() {
        let mgr = ConfigManager::new(StrategyKind::Scalping, &scalping_overrides()).unwrap();
        let StrategyConfig::Scalping(cfg) = mgr.get() else { panic!("wrong variant") };
        assert_eq!(cfg.base.symbol, "BTCUSDT");
        assert_eq!(cfg.price_spread, 2.0);
        assert_eq!(cfg.max_pending_orders, 200); // default survives
    }

    #[test]
    fn test_empty_symbol_rejected() {
        let err = ConfigManager::new(StrategyKind::Scalping, &json!({"price_spread": 1.0})).unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[test]
    fn test_validation_bounds() {
        let bad = [
            json!({"symbol": "BTCUSDT", "notional": 0.0}),
            json!({"symbol": "BTCUSDT", "poll_interval_ms": 100}),
            json!({"symbol": "BTCUSDT", "order_check_interval_ms": 400}),
            json!({"symbol": "BTCUSDT", "max_drawdown_percent": 0.0}),
            json!({"symbol": "BTCUSDT", "max_drawdown_percent": 101.0}),
            json!({"symbol": "BTCUSDT", "leverage": 126}),
            json!({"symbol": "BTCUSDT", "price_precision": 9}),
            json!({"symbol": "BTCUSDT", "price_spread": 0.0}),
            json!({"symbol": "BTCUSDT", "max_pending_orders": 501}),
            json!({"symbol": "BTCUSDT", "merge_threshold": 1}),
            json!({"symbol": "BTCUSDT", "max_pending_orders": 10, "merge_threshold": 11}),
        ];
        for overrides in bad {
            assert!(
                ConfigManager::new(StrategyKind::Scalping, &overrides).is_err(),
                "expected rejection for {}",
                overrides
            );
        }
    }

    #[test]
    fn test_grid_validation() {
        let ok = json!({"symbol": "BTCUSDT", "upper_price": 110.0, "lower_price": 100.0, "grid_count": 10});
        assert!(ConfigManager::new(StrategyKind::Grid, &ok).is_ok());

        let inverted = json!({"symbol": "BTCUSDT", "upper_price": 100.0, "lower_price": 110.0});
        assert!(ConfigManager::new(StrategyKind::Grid, &inverted).is_err());

        let too_few = json!({"symbol": "BTCUSDT", "grid_count": 1});
        assert!(ConfigManager::new(StrategyKind::Grid, &too_few).is_err());

        // Zeroed bounds are allowed at config level; the engine fails fast
        // at start instead.
        let unset = json!({"symbol": "BTCUSDT"});
        assert!(ConfigManager::new(StrategyKind::Grid, &unset).is_ok());
    }

    #[test]
    fn test_update_rejects_immutable_keys_while_running() {
        let mut mgr = ConfigManager::new(StrategyKind::Scalping, &scalping_overrides()).unwrap();
        let err = mgr.update(&json!({"symbol": "ETHUSDT"}), true).unwrap_err();
        assert!(matches!(err, EngineError::ConfigImmutableKey(ref k) if k == "symbol"));

        // Same value is not a change.
        assert!(mgr.update(&json!({"symbol": "BTCUSDT", "notional": 20.0}), true).is_ok());
        assert_eq!(mgr.get().base().notional, 20.0);

        // Stopped instances may change anything.
        assert!(mgr.update(&json!({"symbol": "ETHUSDT"}), false).is_ok());
    }

    #[test]
    fn test_update_rolls_back_on_validation_failure() {
        let mut mgr = ConfigManager::new(StrategyKind::Scalping, &scalping_overrides()).unwrap();
        let before = serde_json::to_value(mgr.get()).unwrap();
        assert!(mgr.update(&json!({"notional": -5.0}), true).is_err());
        let after = serde_json::to_value(mgr.get()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let mgr = ConfigManager::new(StrategyKind::Grid, &json!({
            "symbol": "ETHUSDT", "upper_price": 4000.0, "lower_price": 3000.0,
            "grid_count": 20, "grid_type": "geometric"
        })).unwrap();
        let json = serde_json::to_value(mgr.get()).unwrap();
        assert_eq!(json["strategy_type"], "grid");
        let back: StrategyConfig = serde_json::from_value(json).unwrap();
        let StrategyConfig::Grid(cfg) = back else { panic!("wrong variant") };
        assert_eq!(cfg.grid_type, GridKind::Geometric);
        assert_eq!(cfg.grid_count, 20);
    }

    #[test]
    fn test_spec_precision_override() {
        let mut mgr = ConfigManager::new(StrategyKind::Scalping, &scalping_overrides()).unwrap();
        mgr.apply_spec_precision(1, 6);
        assert_eq!(mgr.get().base().price_precision, 1);
        assert_eq!(mgr.get().base().size_precision, 6);
    }
}
