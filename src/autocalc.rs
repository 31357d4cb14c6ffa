// ─────────────────────────────────────────────────────────────────────────────
// autocalc.rs — full config derivation from a reduced parameter set
//
// (strategy, venue, symbol, notional, risk level) plus the live instrument
// spec, ticker snapshot and account balance produce a complete, validated
// strategy config. The derivation itself is pure: same inputs, same output.
// ─────────────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{ConfigManager, StrategyConfig, StrategyKind};
use crate::error::Result;
use crate::instruments::{round_at_place, InstrumentSpec, SpecCache, VenueKind};
use crate::services::{AccountService, MarketDataService, Ticker};
use crate::tracker::TradeDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Conservative,
    Balanced,
    Aggressive,
}

/// One row of the preset table.
#[derive(Debug, Clone, Copy)]
pub struct RiskPreset {
    pub spread_multiplier: f64,
    pub max_position_percent: f64,
    pub daily_loss_percent: f64,
    pub max_drawdown_percent: f64,
    pub stop_loss_percent: f64,
    pub max_pending_orders: usize,
    pub merge_threshold: usize,
    pub poll_interval_ms: u64,
    pub order_check_interval_ms: u64,
    pub cooldown_ms: i64,
    pub range_percent: f64,
    pub grid_count: usize,
}

pub fn preset(level: RiskLevel) -> RiskPreset {
    match level {
        RiskLevel::Conservative => RiskPreset {
            spread_multiplier: 3.0,
            max_position_percent: 0.10,
            daily_loss_percent: 0.02,
            max_drawdown_percent: 3.0,
            stop_loss_percent: 2.0,
            max_pending_orders: 100,
            merge_threshold: 15,
            poll_interval_ms: 2000,
            order_check_interval_ms: 3000,
            cooldown_ms: 120_000,
            range_percent: 5.0,
            grid_count: 10,
        },
        RiskLevel::Balanced => RiskPreset {
            spread_multiplier: 2.0,
            max_position_percent: 0.20,
            daily_loss_percent: 0.05,
            max_drawdown_percent: 5.0,
            stop_loss_percent: 3.0,
            max_pending_orders: 200,
            merge_threshold: 21,
            poll_interval_ms: 1000,
            order_check_interval_ms: 2000,
            cooldown_ms: 60_000,
            range_percent: 10.0,
            grid_count: 20,
        },
        RiskLevel::Aggressive => RiskPreset {
            spread_multiplier: 1.5,
            max_position_percent: 0.40,
            daily_loss_percent: 0.10,
            max_drawdown_percent: 10.0,
            stop_loss_percent: 5.0,
            max_pending_orders: 300,
            merge_threshold: 30,
            poll_interval_ms: 500,
            order_check_interval_ms: 1000,
            cooldown_ms: 30_000,
            range_percent: 20.0,
            grid_count: 50,
        },
    }
}

#[derive(Debug, Clone)]
pub struct AutoCalcInput {
    pub strategy_type: StrategyKind,
    pub trading_type: VenueKind,
    pub symbol: String,
    pub notional: f64,
    pub risk_level: RiskLevel,
    pub direction: Option<TradeDirection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoCalcResult {
    pub config: StrategyConfig,
    /// Human-readable notes on what was derived and any warnings.
    pub derivations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldBounds {
    pub min: f64,
    pub recommended: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoCalcBounds {
    pub price_spread: FieldBounds,
    pub notional: FieldBounds,
    pub max_position: FieldBounds,
    pub max_daily_loss: FieldBounds,
}

/// Pure derivation. Deterministic for a fixed (input, spec, ticker, balance).
pub fn derive_config(
    input: &AutoCalcInput,
    spec: &InstrumentSpec,
    ticker: &Ticker,
    balance: f64,
) -> Result<AutoCalcResult> {
    let p = preset(input.risk_level);
    let mut notes = Vec::new();
    let range_24h = (ticker.high_24h - ticker.low_24h).max(0.0);
    let fee_sum = spec.maker_fee_rate + spec.taker_fee_rate;

    let max_position = round_at_place(balance * p.max_position_percent, 2);
    let max_daily_loss = round_at_place(balance * p.daily_loss_percent, 2);

    let mut overrides = json!({
        "symbol": input.symbol,
        "trading_type": input.trading_type,
        "notional": input.notional,
        "max_position": max_position,
        "max_daily_loss": max_daily_loss,
        "max_drawdown_percent": p.max_drawdown_percent,
        "stop_loss_percent": p.stop_loss_percent,
        "cooldown_ms": p.cooldown_ms,
        "poll_interval_ms": p.poll_interval_ms,
        "order_check_interval_ms": p.order_check_interval_ms,
        "price_precision": spec.price_place,
        "size_precision": spec.volume_place,
    });
    if let Some(direction) = input.direction {
        overrides["direction"] = json!(direction);
    }

    let config = match input.strategy_type {
        StrategyKind::Scalping => {
            let min_spread = ticker.last * fee_sum * p.spread_multiplier;
            let price_spread =
                round_at_place(min_spread.max(range_24h * 0.001), spec.price_place);
            notes.push(format!(
                "price_spread {} from fee floor {:.6} and 24h range {:.2}",
                price_spread, min_spread, range_24h
            ));
            overrides["price_spread"] = json!(price_spread);
            overrides["max_pending_orders"] = json!(p.max_pending_orders);
            overrides["merge_threshold"] = json!(p.merge_threshold);
            ConfigManager::new(StrategyKind::Scalping, &overrides)?.snapshot()
        }
        StrategyKind::Grid => {
            let upper = round_at_place(
                ticker.last * (1.0 + p.range_percent / 200.0),
                spec.price_place,
            );
            let lower = round_at_place(
                ticker.last * (1.0 - p.range_percent / 200.0),
                spec.price_place,
            );
            let spacing = (upper - lower) / p.grid_count as f64;
            let min_profitable_spread = ticker.last * fee_sum * 2.0;
            notes.push(format!(
                "grid [{}, {}] with {} rungs (spacing {:.6})",
                lower, upper, p.grid_count, spacing
            ));
            if spacing < min_profitable_spread {
                notes.push(format!(
                    "warning: grid spacing {:.6} is below the profitable minimum {:.6}; \
                     fees will eat each round trip",
                    spacing, min_profitable_spread
                ));
            }
            overrides["upper_price"] = json!(upper);
            overrides["lower_price"] = json!(lower);
            overrides["grid_count"] = json!(p.grid_count);
            ConfigManager::new(StrategyKind::Grid, &overrides)?.snapshot()
        }
    };

    Ok(AutoCalcResult { config, derivations: notes })
}

/// Per-field envelopes for the config editor, derived from the same inputs.
pub fn calc_bounds(spec: &InstrumentSpec, ticker: &Ticker, balance: f64) -> AutoCalcBounds {
    let range_24h = (ticker.high_24h - ticker.low_24h).max(0.0);
    let fee_sum = spec.maker_fee_rate + spec.taker_fee_rate;
    let breakeven = round_at_place(ticker.last * fee_sum, spec.price_place);
    let balanced = preset(RiskLevel::Balanced);

    AutoCalcBounds {
        price_spread: FieldBounds {
            min: breakeven.max(spec.tick_size()),
            recommended: round_at_place(
                (ticker.last * fee_sum * balanced.spread_multiplier).max(range_24h * 0.001),
                spec.price_place,
            ),
            max: round_at_place(range_24h * 0.05, spec.price_place),
        },
        notional: FieldBounds {
            min: round_at_place(spec.min_trade_num * ticker.last, 2),
            recommended: round_at_place(balance * 0.01, 2),
            max: round_at_place(balance * 0.5, 2),
        },
        max_position: FieldBounds {
            min: round_at_place(spec.min_trade_num * ticker.last, 2),
            recommended: round_at_place(balance * balanced.max_position_percent, 2),
            max: round_at_place(balance, 2),
        },
        max_daily_loss: FieldBounds {
            min: 1.0,
            recommended: round_at_place(balance * balanced.daily_loss_percent, 2),
            max: round_at_place(balance * 0.25, 2),
        },
    }
}

/// Gathers the live inputs and runs the pure derivation.
pub async fn auto_calc(
    input: &AutoCalcInput,
    specs: &SpecCache,
    market: &dyn MarketDataService,
    account: &dyn AccountService,
) -> Result<AutoCalcResult> {
    let spec = specs.get_spec(&input.symbol, input.trading_type).await?;
    let ticker = market.ticker(&input.symbol).await?;
    let balance = account.available_balance(&input.symbol).await?;
    derive_config(input, &spec, &ticker, balance)
}

pub fn bounds_json(bounds: &AutoCalcBounds) -> Value {
    serde_json::to_value(bounds).unwrap_or_else(|_| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_spec() -> InstrumentSpec {
        InstrumentSpec {
            symbol: "BTCUSDT".into(),
            venue: VenueKind::Derivatives,
            base_coin: "BTC".into(),
            quote_coin: "USDT".into(),
            price_place: 1,
            volume_place: 6,
            min_trade_num: 0.0001,
            size_multiplier: 1.0,
            maker_fee_rate: 0.0002,
            taker_fee_rate: 0.0006,
            status: "normal".into(),
        }
    }

    fn ticker() -> Ticker {
        Ticker {
            last: 70_000.0,
            high_24h: 71_000.0,
            low_24h: 69_000.0,
            bid: Some(69_999.9),
            ask: Some(70_000.1),
        }
    }

    fn scalping_input(level: RiskLevel) -> AutoCalcInput {
        AutoCalcInput {
            strategy_type: StrategyKind::Scalping,
            trading_type: VenueKind::Derivatives,
            symbol: "BTCUSDT".into(),
            notional: 10.0,
            risk_level: level,
            direction: Some(TradeDirection::Long),
        }
    }

    #[test]
    fn test_preset_table_values() {
        let c = preset(RiskLevel::Conservative);
        assert_eq!(c.spread_multiplier, 3.0);
        assert_eq!(c.max_position_percent, 0.10);
        assert_eq!(c.daily_loss_percent, 0.02);
        assert_eq!(c.max_drawdown_percent, 3.0);
        assert_eq!(c.max_pending_orders, 100);
        assert_eq!(c.merge_threshold, 15);
        assert_eq!(c.poll_interval_ms, 2000);
        assert_eq!(c.cooldown_ms, 120_000);
        assert_eq!((c.range_percent, c.grid_count), (5.0, 10));

        let b = preset(RiskLevel::Balanced);
        assert_eq!(b.spread_multiplier, 2.0);
        assert_eq!(b.merge_threshold, 21);
        assert_eq!((b.range_percent, b.grid_count), (10.0, 20));

        let a = preset(RiskLevel::Aggressive);
        assert_eq!(a.spread_multiplier, 1.5);
        assert_eq!(a.max_position_percent, 0.40);
        assert_eq!(a.max_pending_orders, 300);
        assert_eq!(a.cooldown_ms, 30_000);
        assert_eq!((a.range_percent, a.grid_count), (20.0, 50));
    }

    #[test]
    fn test_scalping_derivation_balanced() {
        let result =
            derive_config(&scalping_input(RiskLevel::Balanced), &btc_spec(), &ticker(), 10_000.0)
                .unwrap();
        let StrategyConfig::Scalping(cfg) = result.config else { panic!("wrong variant") };

        // min_spread = 70000 * 0.0008 * 2.0 = 112; range floor = 2000 * 0.001 = 2.
        assert_eq!(cfg.price_spread, 112.0);
        assert_eq!(cfg.base.max_position, 2000.0);
        assert_eq!(cfg.base.max_daily_loss, 500.0);
        assert_eq!(cfg.base.max_drawdown_percent, 5.0);
        assert_eq!(cfg.max_pending_orders, 200);
        assert_eq!(cfg.merge_threshold, 21);
        assert_eq!(cfg.base.poll_interval_ms, 1000);
        assert_eq!(cfg.base.price_precision, 1);
        assert_eq!(cfg.base.size_precision, 6);
        assert_eq!(cfg.base.direction, Some(TradeDirection::Long));
    }

    #[test]
    fn test_scalping_range_floor_wins_on_flat_fees() {
        // With a zero-fee instrument, the 24h-range floor sets the spread.
        let mut spec = btc_spec();
        spec.maker_fee_rate = 0.0;
        spec.taker_fee_rate = 0.0;
        let result =
            derive_config(&scalping_input(RiskLevel::Balanced), &spec, &ticker(), 10_000.0)
                .unwrap();
        let StrategyConfig::Scalping(cfg) = result.config else { panic!("wrong variant") };
        assert_eq!(cfg.price_spread, 2.0);
    }

    #[test]
    fn test_grid_derivation_balanced() {
        let input = AutoCalcInput {
            strategy_type: StrategyKind::Grid,
            trading_type: VenueKind::Derivatives,
            symbol: "BTCUSDT".into(),
            notional: 10.0,
            risk_level: RiskLevel::Balanced,
            direction: None,
        };
        let result = derive_config(&input, &btc_spec(), &ticker(), 10_000.0).unwrap();
        let StrategyConfig::Grid(cfg) = result.config else { panic!("wrong variant") };

        // range 10% → ±5% around 70000.
        assert_eq!(cfg.upper_price, 73_500.0);
        assert_eq!(cfg.lower_price, 66_500.0);
        assert_eq!(cfg.grid_count, 20);
        assert_eq!(cfg.base.max_position, 2000.0);
        // spacing 350 vs profitable minimum 112: no warning expected.
        assert!(!result.derivations.iter().any(|n| n.contains("warning")));
    }

    #[test]
    fn test_grid_warns_on_unprofitable_spacing() {
        let input = AutoCalcInput {
            strategy_type: StrategyKind::Grid,
            trading_type: VenueKind::Derivatives,
            symbol: "BTCUSDT".into(),
            notional: 10.0,
            risk_level: RiskLevel::Conservative,
            direction: None,
        };
        let mut spec = btc_spec();
        spec.maker_fee_rate = 0.002;
        spec.taker_fee_rate = 0.006;
        let result = derive_config(&input, &spec, &ticker(), 10_000.0).unwrap();
        // spacing = 3500/10 = 350 < 70000 * 0.008 * 2 = 1120.
        assert!(result.derivations.iter().any(|n| n.contains("warning")));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_config(&scalping_input(RiskLevel::Aggressive), &btc_spec(), &ticker(), 10_000.0)
            .unwrap();
        let b = derive_config(&scalping_input(RiskLevel::Aggressive), &btc_spec(), &ticker(), 10_000.0)
            .unwrap();
        let mut ja = serde_json::to_value(&a.config).unwrap();
        let mut jb = serde_json::to_value(&b.config).unwrap();
        // instance ids are freshly generated per call; everything else must match.
        ja["instance_id"] = json!(null);
        jb["instance_id"] = json!(null);
        assert_eq!(ja, jb);
    }

    #[test]
    fn test_bounds_envelope() {
        let bounds = calc_bounds(&btc_spec(), &ticker(), 10_000.0);
        // priceSpread.max = 24h range * 0.05.
        assert_eq!(bounds.price_spread.max, 100.0);
        // breakeven floor = 70000 * 0.0008 = 56.
        assert_eq!(bounds.price_spread.min, 56.0);
        assert_eq!(bounds.max_position.recommended, 2000.0);
        assert_eq!(bounds.max_daily_loss.recommended, 500.0);
        assert!(bounds.notional.min <= bounds.notional.recommended);
        assert!(bounds.notional.recommended <= bounds.notional.max);
    }
}
