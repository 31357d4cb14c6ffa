// ─────────────────────────────────────────────────────────────────────────────
// grid.rs — fixed price-ladder strategy
//
// A ladder of gridCount+1 levels spans [lower_price, upper_price]. Each rung
// cycles empty → buy_pending → buy_filled → sell_pending → empty, selling at
// the next-higher rung's price. One main loop reconciles, then quotes.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::{ConfigManager, GridConfig, GridKind, HoldMode, StrategyConfig, StrategyKind};
use crate::error::{EngineError, Result};
use crate::events::{EventKind, EventLog, StrategyEvent};
use crate::instruments::{InstrumentSpec, SpecCache, VenueKind};
use crate::manager::{EngineState, EngineStatus, StrategyEngine};
use crate::persistence::{OrderContext, PersistenceWorker};
use crate::risk::{RiskController, RiskLimits, RiskVerdict};
use crate::services::{OrderRequest, TimeInForce, TradeSide, TradingServices};
use crate::tracker::{
    map_exchange_state, ExchangeOrderState, OrderStatus, OrderTracker, Side, TrackedOrder,
    TradeDirection,
};

/// Spot/derivatives inventory settles noticeably faster than the scalper's
/// paired sells; 800 ms is enough before the first sell attempt.
const SELL_SETTLE_MS: u64 = 800;
const SELL_ATTEMPTS: usize = 3;
const CANCEL_BATCH: usize = 50;
const CONSECUTIVE_ERROR_LIMIT: u32 = 5;
const ERROR_RECOVERY_DELAY_S: u64 = 30;
const MIN_POLL_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelState {
    Empty,
    BuyPending,
    BuyFilled,
    SellPending,
}

impl LevelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelState::Empty => "empty",
            LevelState::BuyPending => "buy_pending",
            LevelState::BuyFilled => "buy_filled",
            LevelState::SellPending => "sell_pending",
        }
    }
}

/// One rung of the ladder. `price` doubles as the paired buy price when the
/// rung holds inventory.
#[derive(Debug, Clone, Serialize)]
pub struct GridLevel {
    pub index: usize,
    pub price: f64,
    pub price_str: String,
    pub size: String,
    pub state: LevelState,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
}

impl GridLevel {
    fn reset(&mut self) {
        self.state = LevelState::Empty;
        self.buy_order_id = None;
        self.sell_order_id = None;
    }
}

/// Builds the ladder. Fails fast on a degenerate range or a notional that
/// cannot meet the instrument minimum anywhere on the ladder.
pub fn build_levels(cfg: &GridConfig, spec: &InstrumentSpec) -> Result<Vec<GridLevel>> {
    let (lower, upper, count) = (cfg.lower_price, cfg.upper_price, cfg.grid_count);
    if lower <= 0.0 || upper <= 0.0 {
        return Err(EngineError::GridConfigInvalid(
            "grid bounds must be positive".into(),
        ));
    }
    if upper <= lower {
        return Err(EngineError::GridConfigInvalid(format!(
            "upper_price {} must exceed lower_price {}",
            upper, lower
        )));
    }
    let mut levels = Vec::with_capacity(count + 1);
    for i in 0..=count {
        let price = match cfg.grid_type {
            GridKind::Arithmetic => lower + i as f64 * (upper - lower) / count as f64,
            GridKind::Geometric => lower * (upper / lower).powf(i as f64 / count as f64),
        };
        let size = spec.calc_size(cfg.base.notional, price).ok_or_else(|| {
            EngineError::GridConfigInvalid(format!(
                "notional {} is below the tradable minimum at level {} ({})",
                cfg.base.notional, i, price
            ))
        })?;
        levels.push(GridLevel {
            index: i,
            price,
            price_str: spec.format_price(price),
            size,
            state: LevelState::Empty,
            buy_order_id: None,
            sell_order_id: None,
        });
    }
    Ok(levels)
}

/// Sell target for a rung: the next-higher rung's price, or one spacing
/// above the ceiling rung.
fn sell_price_for(levels: &[GridLevel], index: usize, spec: &InstrumentSpec) -> String {
    if index + 1 < levels.len() {
        levels[index + 1].price_str.clone()
    } else {
        let spacing = if levels.len() >= 2 {
            levels[index].price - levels[index - 1].price
        } else {
            0.0
        };
        spec.format_price(levels[index].price + spacing)
    }
}

/// Re-attaches recovered pending orders to their rungs by price. A buy rests
/// at its own rung; a sell rests one rung above the inventory it closes.
fn adopt_orders(levels: &mut [GridLevel], orders: &[TrackedOrder]) {
    for order in orders {
        match order.side {
            Side::Buy => {
                if let Some(level) = levels.iter_mut().find(|l| l.price_str == order.price) {
                    if level.state == LevelState::Empty {
                        level.state = LevelState::BuyPending;
                        level.buy_order_id = Some(order.order_id.clone());
                    }
                }
            }
            Side::Sell => {
                let at = levels.iter().position(|l| l.price_str == order.price);
                if let Some(at) = at {
                    if at > 0 && levels[at - 1].state == LevelState::Empty {
                        levels[at - 1].state = LevelState::SellPending;
                        levels[at - 1].sell_order_id = Some(order.order_id.clone());
                    }
                }
            }
        }
    }
}

pub struct GridEngine {
    ctx: Arc<GridCtx>,
}

pub(crate) struct GridCtx {
    services: TradingServices,
    specs: Arc<SpecCache>,
    persistence: PersistenceWorker,
    config: Mutex<ConfigManager>,
    spec: Mutex<Option<InstrumentSpec>>,
    pub(crate) levels: Mutex<Vec<GridLevel>>,
    pub(crate) tracker: Arc<Mutex<OrderTracker>>,
    pub(crate) risk: Mutex<Option<RiskController>>,
    pub(crate) events: Mutex<EventLog>,
    status: Mutex<EngineStatus>,
    run_flag: Mutex<Arc<AtomicBool>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    risk_denied_edge: AtomicBool,
    error_count: AtomicU32,
    last_error: Mutex<Option<String>>,
    realized_pnl: Mutex<f64>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl GridEngine {
    pub fn new(
        services: TradingServices,
        specs: Arc<SpecCache>,
        persistence: PersistenceWorker,
        config: ConfigManager,
    ) -> Result<Self> {
        if config.get().kind() != StrategyKind::Grid {
            return Err(EngineError::ConfigInvalid(
                "grid engine requires a grid config".into(),
            ));
        }
        Ok(Self {
            ctx: Arc::new(GridCtx {
                services,
                specs,
                persistence,
                config: Mutex::new(config),
                spec: Mutex::new(None),
                levels: Mutex::new(Vec::new()),
                tracker: Arc::new(Mutex::new(OrderTracker::new())),
                risk: Mutex::new(None),
                events: Mutex::new(EventLog::new()),
                status: Mutex::new(EngineStatus::Stopped),
                run_flag: Mutex::new(Arc::new(AtomicBool::new(true))),
                tasks: Mutex::new(Vec::new()),
                risk_denied_edge: AtomicBool::new(false),
                error_count: AtomicU32::new(0),
                last_error: Mutex::new(None),
                realized_pnl: Mutex::new(0.0),
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn ctx(&self) -> &Arc<GridCtx> {
        &self.ctx
    }
}

impl GridCtx {
    fn grid_config(&self) -> GridConfig {
        match self.config.lock().unwrap().snapshot() {
            StrategyConfig::Grid(c) => c,
            StrategyConfig::Scalping(_) => unreachable!("constructor enforces the variant"),
        }
    }

    fn current_spec(&self) -> Result<InstrumentSpec> {
        self.spec.lock().unwrap().clone().ok_or(EngineError::NotRunning)
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn get_status(&self) -> EngineStatus {
        *self.status.lock().unwrap()
    }

    fn emit(&self, kind: EventKind, data: Value) {
        log::info!("[GRID] {:?} {}", kind, data);
        self.events.lock().unwrap().emit(kind, data);
    }

    fn order_ctx(&self) -> OrderContext {
        let cfg = self.grid_config();
        OrderContext {
            symbol: cfg.base.symbol.clone(),
            venue_code: self.services.venue.code().to_string(),
            margin_coin: cfg.base.margin_coin.clone().unwrap_or_else(|| "USDT".into()),
            strategy_type: StrategyKind::Grid.as_str().to_string(),
            trading_type: self.services.venue.as_str().to_string(),
        }
    }

    fn direction(&self) -> TradeDirection {
        self.grid_config().base.direction.unwrap_or(TradeDirection::Long)
    }

    fn entry_trade_side(&self) -> Option<TradeSide> {
        match (self.services.venue, self.services.hold_mode) {
            (VenueKind::Derivatives, HoldMode::DoubleHold) => Some(TradeSide::Open),
            _ => None,
        }
    }

    fn exit_trade_side(&self) -> Option<TradeSide> {
        match (self.services.venue, self.services.hold_mode) {
            (VenueKind::Derivatives, HoldMode::DoubleHold) => Some(TradeSide::Close),
            _ => None,
        }
    }

    fn persist_level(&self, level: &GridLevel) {
        let instance_id = self.grid_config().base.instance_id;
        self.persistence.persist_grid_level(
            &instance_id,
            level.index,
            &level.price_str,
            level.state.as_str(),
            &level.size,
            level.buy_order_id.as_deref(),
            level.sell_order_id.as_deref(),
        );
    }

    // ─── Main loop body ──────────────────────────────────────────────────────

    pub(crate) async fn tick(&self) -> Result<()> {
        let cfg = self.grid_config();
        let spec = self.current_spec()?;
        let symbol = cfg.base.symbol.clone();

        let current_price = self.services.market.ticker(&symbol).await?.last;
        if current_price <= 0.0 {
            return Err(EngineError::Transport("ticker returned a zero price".into()));
        }

        self.reconcile(&symbol).await?;
        self.place_buys(&symbol, current_price).await?;
        self.place_sells(&symbol, &spec).await?;

        self.tracker.lock().unwrap().cleanup();

        let equity = self.services.account.account_equity(&symbol).await?;
        if let Some(risk) = self.risk.lock().unwrap().as_mut() {
            risk.update_equity(equity.equity);
        }
        Ok(())
    }

    /// Drives level transitions from the exchange's view, two-step as in
    /// the scalper: missing from the pending list → confirm via detail.
    async fn reconcile(&self, symbol: &str) -> Result<()> {
        let watched: Vec<(usize, String, Side)> = {
            let levels = self.levels.lock().unwrap();
            levels
                .iter()
                .filter_map(|l| match l.state {
                    LevelState::BuyPending => {
                        l.buy_order_id.clone().map(|id| (l.index, id, Side::Buy))
                    }
                    LevelState::SellPending => {
                        l.sell_order_id.clone().map(|id| (l.index, id, Side::Sell))
                    }
                    _ => None,
                })
                .collect()
        };
        if watched.is_empty() {
            return Ok(());
        }

        let exchange_pending: HashSet<String> = self
            .services
            .order
            .pending_orders(symbol)
            .await?
            .into_iter()
            .map(|o| o.order_id)
            .collect();

        for (index, order_id, side) in watched {
            if exchange_pending.contains(&order_id) {
                continue;
            }
            let detail = match self.services.order.order_detail(symbol, &order_id).await {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("[GRID] detail lookup failed for {}: {}", order_id, e);
                    continue;
                }
            };
            match (side, map_exchange_state(&detail.state)) {
                (_, ExchangeOrderState::Live | ExchangeOrderState::PartiallyFilled) => {}
                (Side::Buy, ExchangeOrderState::Filled) => {
                    let filled_at = detail.updated_at.unwrap_or_else(now_ms);
                    self.tracker.lock().unwrap().mark_filled(&order_id, filled_at);
                    self.persistence.persist_order_status_change(
                        &order_id,
                        OrderStatus::Filled,
                        Some(filled_at),
                        None,
                    );
                    let snapshot = {
                        let mut levels = self.levels.lock().unwrap();
                        let level = &mut levels[index];
                        level.state = LevelState::BuyFilled;
                        level.clone()
                    };
                    self.persist_level(&snapshot);
                    self.emit(
                        EventKind::GridBuyFilled,
                        json!({ "level": index, "order_id": order_id, "price": snapshot.price_str }),
                    );
                }
                (Side::Buy, ExchangeOrderState::Cancelled) => {
                    self.tracker.lock().unwrap().mark_cancelled(&order_id);
                    self.persistence.persist_order_status_change(
                        &order_id,
                        OrderStatus::Cancelled,
                        None,
                        None,
                    );
                    let snapshot = {
                        let mut levels = self.levels.lock().unwrap();
                        levels[index].reset();
                        levels[index].clone()
                    };
                    self.persist_level(&snapshot);
                }
                (Side::Sell, ExchangeOrderState::Filled) => {
                    let filled_at = detail.updated_at.unwrap_or_else(now_ms);
                    self.tracker.lock().unwrap().mark_filled(&order_id, filled_at);
                    self.persistence.persist_order_status_change(
                        &order_id,
                        OrderStatus::Filled,
                        Some(filled_at),
                        None,
                    );
                    self.on_grid_sell_filled(index, &order_id);
                }
                (Side::Sell, ExchangeOrderState::Cancelled) => {
                    self.tracker.lock().unwrap().mark_cancelled(&order_id);
                    self.persistence.persist_order_status_change(
                        &order_id,
                        OrderStatus::Cancelled,
                        None,
                        None,
                    );
                    // The buy behind this sell already filled; resetting the
                    // rung re-arms quoting but the inventory is now orphaned
                    // and the operator must see it.
                    let snapshot = {
                        let mut levels = self.levels.lock().unwrap();
                        levels[index].reset();
                        levels[index].clone()
                    };
                    log::warn!(
                        "[GRID] sell {} at level {} cancelled by the exchange; {} of inventory is orphaned",
                        order_id, index, snapshot.size
                    );
                    self.emit(
                        EventKind::GridLevelUpdated,
                        json!({
                            "level": index,
                            "state": "empty",
                            "orphaned_size": snapshot.size,
                            "reason": "sell_cancelled_after_fill",
                        }),
                    );
                    self.persist_level(&snapshot);
                }
            }
        }
        Ok(())
    }

    /// Buys every empty rung strictly below the current price, stopping at
    /// the first risk denial.
    async fn place_buys(&self, symbol: &str, current_price: f64) -> Result<()> {
        let candidates: Vec<(usize, String, String)> = {
            let levels = self.levels.lock().unwrap();
            levels
                .iter()
                .filter(|l| l.state == LevelState::Empty && l.price < current_price)
                .map(|l| (l.index, l.price_str.clone(), l.size.clone()))
                .collect()
        };

        for (index, price, size) in candidates {
            let now = now_ms();
            let position = self.tracker.lock().unwrap().position_notional();
            let verdict = match self.risk.lock().unwrap().as_mut() {
                Some(risk) => risk.check_can_trade(now, position),
                None => RiskVerdict::Allowed,
            };
            if let RiskVerdict::Denied { reason } = verdict {
                if !self.risk_denied_edge.swap(true, Ordering::SeqCst) {
                    self.emit(EventKind::RiskLimitHit, json!({ "reason": reason }));
                }
                break;
            }
            self.risk_denied_edge.store(false, Ordering::SeqCst);

            // gtc, not post-only: geometric ladders may straddle the mark.
            let request = OrderRequest::limit(symbol, Side::Buy, &price, &size, TimeInForce::Gtc)
                .with_trade_side(self.entry_trade_side())
                .with_client_oid(format!("grid-b{}-{}", index, uuid::Uuid::new_v4().simple()));
            let placed = self.services.order.place_order(&request).await?;

            let order = TrackedOrder {
                order_id: placed.order_id.clone(),
                client_oid: request.client_oid.clone().unwrap_or_default(),
                side: Side::Buy,
                price: price.clone(),
                size: size.clone(),
                status: OrderStatus::Pending,
                linked_order_id: None,
                direction: self.direction(),
                created_at: now,
                filled_at: None,
            };
            self.tracker.lock().unwrap().insert(order.clone());
            self.persistence.persist_new_order(&order, self.order_ctx());

            let snapshot = {
                let mut levels = self.levels.lock().unwrap();
                let level = &mut levels[index];
                level.state = LevelState::BuyPending;
                level.buy_order_id = Some(placed.order_id.clone());
                level.clone()
            };
            self.persist_level(&snapshot);
            self.emit(
                EventKind::BuyOrderPlaced,
                json!({ "level": index, "order_id": placed.order_id, "price": price, "size": size }),
            );
        }
        Ok(())
    }

    /// Pairs a sell for every rung holding inventory. A rung that cannot
    /// sell (position not settled) stays buy_filled for the next tick.
    async fn place_sells(&self, symbol: &str, spec: &InstrumentSpec) -> Result<()> {
        let holding: Vec<usize> = {
            let levels = self.levels.lock().unwrap();
            levels
                .iter()
                .filter(|l| l.state == LevelState::BuyFilled)
                .map(|l| l.index)
                .collect()
        };

        for index in holding {
            let (sell_price, size, buy_order_id) = {
                let levels = self.levels.lock().unwrap();
                (
                    sell_price_for(&levels, index, spec),
                    levels[index].size.clone(),
                    levels[index].buy_order_id.clone(),
                )
            };

            tokio::time::sleep(std::time::Duration::from_millis(SELL_SETTLE_MS)).await;

            for attempt in 0..SELL_ATTEMPTS {
                let request =
                    OrderRequest::limit(symbol, Side::Sell, &sell_price, &size, TimeInForce::Gtc)
                        .with_trade_side(self.exit_trade_side())
                        .with_client_oid(format!(
                            "grid-s{}-{}",
                            index,
                            uuid::Uuid::new_v4().simple()
                        ));
                match self.services.order.place_order(&request).await {
                    Ok(placed) => {
                        let order = TrackedOrder {
                            order_id: placed.order_id.clone(),
                            client_oid: request.client_oid.clone().unwrap_or_default(),
                            side: Side::Sell,
                            price: sell_price.clone(),
                            size: size.clone(),
                            status: OrderStatus::Pending,
                            linked_order_id: buy_order_id.clone(),
                            created_at: now_ms(),
                            filled_at: None,
                            direction: self.direction(),
                        };
                        {
                            let mut tracker = self.tracker.lock().unwrap();
                            tracker.insert(order.clone());
                            if let Some(buy_id) = &buy_order_id {
                                tracker.link(buy_id, &placed.order_id);
                            }
                        }
                        self.persistence.persist_new_order(&order, self.order_ctx());

                        let snapshot = {
                            let mut levels = self.levels.lock().unwrap();
                            let level = &mut levels[index];
                            level.state = LevelState::SellPending;
                            level.sell_order_id = Some(placed.order_id.clone());
                            level.clone()
                        };
                        self.persist_level(&snapshot);
                        self.emit(
                            EventKind::SellOrderPlaced,
                            json!({
                                "level": index,
                                "order_id": placed.order_id,
                                "price": sell_price,
                                "size": size,
                            }),
                        );
                        break;
                    }
                    Err(e) if e.is_position_retryable() && attempt + 1 < SELL_ATTEMPTS => {
                        log::warn!(
                            "[GRID] sell attempt {}/{} at level {} rejected ({}), retrying",
                            attempt + 1, SELL_ATTEMPTS, index, e
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(SELL_SETTLE_MS)).await;
                    }
                    Err(e) => {
                        log::warn!(
                            "[GRID] sell at level {} failed ({}); rung stays buy_filled",
                            index, e
                        );
                        self.emit(
                            EventKind::SellOrderFailed,
                            json!({ "level": index, "error": e.to_string() }),
                        );
                        break;
                    }
                }
            }
            // A rung that could not sell keeps its buy_filled state; the
            // next tick retries from there.
        }
        Ok(())
    }

    fn on_grid_sell_filled(&self, index: usize, sell_order_id: &str) {
        let cfg = self.grid_config();
        let spec = match self.current_spec() {
            Ok(s) => s,
            Err(_) => return,
        };
        let (buy_price, size_str, snapshot) = {
            let mut levels = self.levels.lock().unwrap();
            let level = &mut levels[index];
            let buy_price = level.price;
            let size = level.size.clone();
            level.reset();
            (buy_price, size, level.clone())
        };
        let sell_price = self
            .tracker
            .lock()
            .unwrap()
            .get(sell_order_id)
            .map(|o| o.price_f64())
            .unwrap_or(buy_price);
        let size: f64 = size_str.parse().unwrap_or(0.0);

        let gross = (sell_price - buy_price) * size;
        let fee = 2.0 * cfg.base.notional * spec.maker_fee_rate;
        let net = gross - fee;

        *self.realized_pnl.lock().unwrap() += net;
        if let Some(risk) = self.risk.lock().unwrap().as_mut() {
            risk.record_pnl(net);
        }
        self.persistence
            .persist_realized_pnl(net, fee, net >= 0.0, StrategyKind::Grid.as_str());
        self.persist_level(&snapshot);
        self.emit(
            EventKind::GridSellFilled,
            json!({
                "level": index,
                "order_id": sell_order_id,
                "buy_price": buy_price,
                "sell_price": sell_price,
                "size": size_str,
                "gross_pnl": gross,
                "fee": fee,
                "net_pnl": net,
            }),
        );
    }

    /// Cancels every locally-pending order in batches and resets the rungs.
    async fn cancel_all_and_reset(&self) -> usize {
        let symbol = self.grid_config().base.symbol;
        let pending = self.tracker.lock().unwrap().pending_ids();
        let mut cancelled_total = 0usize;
        for chunk in pending.chunks(CANCEL_BATCH) {
            match self.services.order.batch_cancel(&symbol, chunk).await {
                Ok(result) => {
                    let mut tracker = self.tracker.lock().unwrap();
                    for id in &result.cancelled {
                        tracker.mark_cancelled(id);
                        self.persistence.persist_order_status_change(
                            id,
                            OrderStatus::Cancelled,
                            None,
                            None,
                        );
                    }
                    cancelled_total += result.cancelled.len();
                }
                Err(e) => log::error!("[GRID] batch cancel failed: {}", e),
            }
        }
        let snapshots: Vec<GridLevel> = {
            let mut levels = self.levels.lock().unwrap();
            levels
                .iter_mut()
                .filter(|l| l.state != LevelState::Empty)
                .map(|l| {
                    l.reset();
                    l.clone()
                })
                .collect()
        };
        for snapshot in &snapshots {
            self.persist_level(snapshot);
        }
        cancelled_total
    }

    fn note_loop_error(ctx: &Arc<GridCtx>, e: &EngineError, consecutive: u32, run_flag: &Arc<AtomicBool>) -> bool {
        ctx.error_count.fetch_add(1, Ordering::SeqCst);
        *ctx.last_error.lock().unwrap() = Some(e.to_string());
        log::error!("[GRID] loop error ({} consecutive): {}", consecutive, e);

        if e.is_terminal() {
            log::error!("[GRID] auth failure is terminal, stopping the engine");
            run_flag.store(false, Ordering::SeqCst);
            ctx.set_status(EngineStatus::Stopped);
            ctx.emit(EventKind::StrategyStopped, json!({ "reason": "auth_failure" }));
            return false;
        }

        if consecutive >= CONSECUTIVE_ERROR_LIMIT && ctx.get_status() == EngineStatus::Running {
            ctx.set_status(EngineStatus::Error);
            ctx.emit(
                EventKind::StrategyError,
                json!({ "loop": "grid", "error": e.to_string(), "consecutive": consecutive }),
            );
            let recover_ctx = ctx.clone();
            let flag = run_flag.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(ERROR_RECOVERY_DELAY_S)).await;
                if flag.load(Ordering::SeqCst) && recover_ctx.get_status() == EngineStatus::Error {
                    log::info!("[GRID] attempting recovery from ERROR");
                    recover_ctx.set_status(EngineStatus::Running);
                }
            });
            return true;
        }
        false
    }
}

#[async_trait::async_trait]
impl StrategyEngine for GridEngine {
    async fn start(&self) -> Result<()> {
        let ctx = &self.ctx;
        match ctx.get_status() {
            EngineStatus::Starting | EngineStatus::Running => return Err(EngineError::AlreadyRunning),
            _ => {}
        }
        ctx.set_status(EngineStatus::Starting);

        let started = async {
            let cfg = ctx.grid_config();
            let symbol = cfg.base.symbol.clone();

            let spec = ctx.specs.get_spec(&symbol, ctx.services.venue).await?;
            ctx.config
                .lock()
                .unwrap()
                .apply_spec_precision(spec.price_place, spec.volume_place);
            *ctx.spec.lock().unwrap() = Some(spec.clone());

            let mut levels = build_levels(&ctx.grid_config(), &spec)?;

            let equity = ctx.services.account.account_equity(&symbol).await?;
            *ctx.risk.lock().unwrap() = Some(RiskController::new(
                RiskLimits {
                    max_drawdown_percent: cfg.base.max_drawdown_percent,
                    max_daily_loss: cfg.base.max_daily_loss,
                    max_position: cfg.base.max_position,
                    cooldown_ms: cfg.base.cooldown_ms,
                },
                equity.equity,
                now_ms(),
            ));

            match ctx
                .persistence
                .load_pending_orders(&symbol, ctx.services.venue.code())
                .await
            {
                Ok(recovered) if !recovered.is_empty() => {
                    log::info!("[GRID] recovered {} pending orders", recovered.len());
                    adopt_orders(&mut levels, &recovered);
                    let mut tracker = ctx.tracker.lock().unwrap();
                    for order in recovered {
                        tracker.insert(order);
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("[GRID] pending-order recovery failed: {}", e),
            }

            *ctx.levels.lock().unwrap() = levels;

            ctx.emit(
                EventKind::StrategyStarted,
                json!({
                    "symbol": symbol,
                    "instance_id": cfg.base.instance_id,
                    "trading_type": ctx.services.venue.as_str(),
                    "levels": cfg.grid_count + 1,
                    "lower_price": cfg.lower_price,
                    "upper_price": cfg.upper_price,
                    "grid_type": format!("{:?}", cfg.grid_type).to_lowercase(),
                    "equity": equity.equity,
                }),
            );
            Ok::<(), EngineError>(())
        }
        .await;

        if let Err(e) = started {
            ctx.set_status(EngineStatus::Stopped);
            return Err(e);
        }

        let run_flag = Arc::new(AtomicBool::new(true));
        *ctx.run_flag.lock().unwrap() = run_flag.clone();
        let poll_ms = ctx.grid_config().base.poll_interval_ms.max(MIN_POLL_INTERVAL_MS);

        let loop_ctx = ctx.clone();
        let loop_flag = run_flag;
        let main_loop = tokio::spawn(async move {
            let mut consecutive = 0u32;
            loop {
                if !loop_flag.load(Ordering::SeqCst) {
                    break;
                }
                if loop_ctx.get_status() == EngineStatus::Running {
                    match loop_ctx.tick().await {
                        Ok(()) => consecutive = 0,
                        Err(e) => {
                            consecutive += 1;
                            if GridCtx::note_loop_error(&loop_ctx, &e, consecutive, &loop_flag) {
                                consecutive = 0;
                            }
                        }
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(poll_ms)).await;
            }
        });

        *ctx.tasks.lock().unwrap() = vec![main_loop];
        ctx.set_status(EngineStatus::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.get_status() == EngineStatus::Stopped {
            return Ok(());
        }
        ctx.set_status(EngineStatus::Stopping);

        let cancelled = ctx.cancel_all_and_reset().await;
        ctx.run_flag.lock().unwrap().store(false, Ordering::SeqCst);
        let tasks: Vec<_> = ctx.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(std::time::Duration::from_secs(10), task)
                .await
                .is_err()
            {
                log::warn!("[GRID] loop did not drain within 10s, abandoning");
            }
        }

        ctx.set_status(EngineStatus::Stopped);
        ctx.emit(
            EventKind::StrategyStopped,
            json!({ "reason": "requested", "cancelled": cancelled }),
        );
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<()> {
        let ctx = &self.ctx;
        ctx.run_flag.lock().unwrap().store(false, Ordering::SeqCst);
        let cancelled = ctx.cancel_all_and_reset().await;
        ctx.set_status(EngineStatus::Stopped);
        ctx.emit(EventKind::EmergencyStop, json!({ "cancelled": cancelled }));
        Ok(())
    }

    async fn update_config(&self, partial: &Value) -> Result<StrategyConfig> {
        let running = matches!(
            self.ctx.get_status(),
            EngineStatus::Starting | EngineStatus::Running | EngineStatus::Error
        );
        let updated = self.ctx.config.lock().unwrap().update(partial, running)?;
        let json = serde_json::to_value(&updated)
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        self.ctx.persistence.save_active_config(json.clone());
        self.ctx.emit(EventKind::ConfigUpdated, json!({ "config": json }));
        Ok(updated)
    }

    fn status(&self) -> EngineStatus {
        self.ctx.get_status()
    }

    fn state(&self) -> EngineState {
        let ctx = &self.ctx;
        let cfg = ctx.grid_config();
        let tracker = ctx.tracker.lock().unwrap();
        let risk = ctx.risk.lock().unwrap();
        let risk_snap = risk.as_ref().map(|r| r.snapshot());
        let levels = ctx.levels.lock().unwrap();
        let pending_buys = levels.iter().filter(|l| l.state == LevelState::BuyPending).count();
        EngineState {
            status: ctx.get_status(),
            strategy_type: Some(StrategyKind::Grid),
            instance_id: Some(cfg.base.instance_id.clone()),
            symbol: Some(cfg.base.symbol.clone()),
            realized_pnl: *ctx.realized_pnl.lock().unwrap(),
            daily_pnl: risk_snap.as_ref().map(|r| r.daily_pnl).unwrap_or(0.0),
            total_trades: risk_snap.as_ref().map(|r| r.total_trades).unwrap_or(0),
            win_trades: risk_snap.as_ref().map(|r| r.win_trades).unwrap_or(0),
            loss_trades: risk_snap.as_ref().map(|r| r.loss_trades).unwrap_or(0),
            pending_buys,
            pending_sells: tracker.pending_sell_count(),
            position_notional: tracker.position_notional(),
            error_count: ctx.error_count.load(Ordering::SeqCst),
            last_error: ctx.last_error.lock().unwrap().clone(),
            cooling_until: risk_snap.and_then(|r| r.cooling_until),
        }
    }

    fn events(&self, limit: usize) -> Vec<StrategyEvent> {
        self.ctx.events.lock().unwrap().tail(limit)
    }

    fn config(&self) -> StrategyConfig {
        self.ctx.config.lock().unwrap().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigManager;
    use crate::services::stubs::{services_from, StubExchange};
    use serde_json::json;

    fn test_spec() -> InstrumentSpec {
        InstrumentSpec {
            symbol: "ETHUSDT".into(),
            venue: VenueKind::Derivatives,
            base_coin: "ETH".into(),
            quote_coin: "USDT".into(),
            price_place: 2,
            volume_place: 4,
            min_trade_num: 0.001,
            size_multiplier: 1.0,
            maker_fee_rate: 0.0002,
            taker_fee_rate: 0.0006,
            status: "normal".into(),
        }
    }

    fn grid_overrides() -> Value {
        json!({
            "symbol": "ETHUSDT",
            "notional": 10.0,
            "lower_price": 100.0,
            "upper_price": 110.0,
            "grid_count": 10,
            "max_position": 1000.0,
        })
    }

    fn offline_pool() -> sqlx::PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(100))
            .connect_lazy("postgres://u:p@127.0.0.1:1/none")
            .unwrap()
    }

    fn lazy_persistence() -> PersistenceWorker {
        PersistenceWorker::spawn(offline_pool()).0
    }

    fn specs_offline() -> Arc<SpecCache> {
        let creds = crate::signing::ApiCredentials {
            api_key: "k".into(),
            secret_key: "s".into(),
            passphrase: "p".into(),
        };
        let client = Arc::new(crate::exchange::BitgetClient::new(
            creds,
            Some("http://127.0.0.1:1".into()),
            true,
        ));
        Arc::new(SpecCache::new(client, offline_pool()))
    }

    fn engine_with(stub: Arc<StubExchange>, overrides: Value) -> GridEngine {
        let services = services_from(stub, VenueKind::Derivatives, HoldMode::DoubleHold);
        let config = ConfigManager::new(StrategyKind::Grid, &overrides).unwrap();
        let engine =
            GridEngine::new(services, specs_offline(), lazy_persistence(), config).unwrap();
        let spec = test_spec();
        let levels = build_levels(
            &match engine.ctx().config.lock().unwrap().snapshot() {
                StrategyConfig::Grid(c) => c,
                _ => unreachable!(),
            },
            &spec,
        )
        .unwrap();
        *engine.ctx().spec.lock().unwrap() = Some(spec);
        *engine.ctx().levels.lock().unwrap() = levels;
        *engine.ctx().risk.lock().unwrap() = Some(RiskController::new(
            RiskLimits {
                max_drawdown_percent: 50.0,
                max_daily_loss: 1_000_000.0,
                max_position: 1000.0,
                cooldown_ms: 60_000,
            },
            10_000.0,
            now_ms(),
        ));
        *engine.ctx().status.lock().unwrap() = EngineStatus::Running;
        engine
    }

    #[test]
    fn test_arithmetic_ladder() {
        let cfg = match ConfigManager::new(StrategyKind::Grid, &grid_overrides())
            .unwrap()
            .snapshot()
        {
            StrategyConfig::Grid(c) => c,
            _ => unreachable!(),
        };
        let levels = build_levels(&cfg, &test_spec()).unwrap();
        assert_eq!(levels.len(), 11);
        assert_eq!(levels[0].price_str, "100.00");
        assert_eq!(levels[3].price_str, "103.00");
        assert_eq!(levels[10].price_str, "110.00");
        // size = 10 / 103 at four places.
        assert_eq!(levels[3].size, "0.0971");
    }

    #[test]
    fn test_geometric_ladder() {
        let overrides = json!({
            "symbol": "ETHUSDT", "notional": 10.0,
            "lower_price": 100.0, "upper_price": 400.0,
            "grid_count": 2, "grid_type": "geometric",
        });
        let cfg = match ConfigManager::new(StrategyKind::Grid, &overrides).unwrap().snapshot() {
            StrategyConfig::Grid(c) => c,
            _ => unreachable!(),
        };
        let levels = build_levels(&cfg, &test_spec()).unwrap();
        // gridCount = 2 → three price points: 100, 200, 400.
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0].price_str, "100.00");
        assert_eq!(levels[1].price_str, "200.00");
        assert_eq!(levels[2].price_str, "400.00");
    }

    #[test]
    fn test_degenerate_ranges_fail_fast() {
        let spec = test_spec();
        for overrides in [
            json!({"symbol": "ETHUSDT", "lower_price": 0.0, "upper_price": 110.0}),
            json!({"symbol": "ETHUSDT", "lower_price": 110.0, "upper_price": 0.0}),
        ] {
            let cfg = match ConfigManager::new(StrategyKind::Grid, &overrides).unwrap().snapshot() {
                StrategyConfig::Grid(c) => c,
                _ => unreachable!(),
            };
            assert!(matches!(
                build_levels(&cfg, &spec),
                Err(EngineError::GridConfigInvalid(_))
            ));
        }
    }

    #[test]
    fn test_sell_price_targets_next_rung() {
        let cfg = match ConfigManager::new(StrategyKind::Grid, &grid_overrides())
            .unwrap()
            .snapshot()
        {
            StrategyConfig::Grid(c) => c,
            _ => unreachable!(),
        };
        let spec = test_spec();
        let levels = build_levels(&cfg, &spec).unwrap();
        assert_eq!(sell_price_for(&levels, 3, &spec), "104.00");
        // Ceiling rung sells one spacing above itself.
        assert_eq!(sell_price_for(&levels, 10, &spec), "111.00");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_buys_strictly_below_price() {
        let stub = StubExchange::new();
        stub.set_ticker(105.5, 110.0, 100.0, 105.4, 105.6);
        let engine = engine_with(stub.clone(), grid_overrides());

        engine.ctx().tick().await.unwrap();

        // Levels 0..=5 (100..105) sit strictly below 105.5.
        assert_eq!(stub.placed_count(), 6);
        let levels = engine.ctx().levels.lock().unwrap();
        assert_eq!(levels[5].state, LevelState::BuyPending);
        assert_eq!(levels[6].state, LevelState::Empty);
        for req in stub.placed.lock().unwrap().iter() {
            assert_eq!(req.force, TimeInForce::Gtc);
            assert_eq!(req.trade_side, Some(TradeSide::Open));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_buy_fill_schedules_sell_at_next_rung() {
        let stub = StubExchange::new();
        stub.set_ticker(105.5, 110.0, 100.0, 105.4, 105.6);
        let engine = engine_with(stub.clone(), grid_overrides());

        engine.ctx().tick().await.unwrap();

        // Fill level 3's buy (price 103.00).
        let buy_id = engine.ctx().levels.lock().unwrap()[3].buy_order_id.clone().unwrap();
        stub.fill_order(&buy_id, now_ms());

        engine.ctx().tick().await.unwrap();

        let levels = engine.ctx().levels.lock().unwrap();
        assert_eq!(levels[3].state, LevelState::SellPending);
        let sell_id = levels[3].sell_order_id.clone().unwrap();
        drop(levels);

        let tracker = engine.ctx().tracker.lock().unwrap();
        let sell = tracker.get(&sell_id).unwrap();
        assert_eq!(sell.price, "104.00");
        assert_eq!(sell.size, "0.0971");
        assert_eq!(sell.linked_order_id.as_deref(), Some(buy_id.as_str()));
        drop(tracker);

        let events = engine.events(20);
        assert!(events.iter().any(|e| e.kind == EventKind::GridBuyFilled));
        assert!(events.iter().any(|e| e.kind == EventKind::SellOrderPlaced));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sell_fill_realizes_pnl_and_resets_rung() {
        let stub = StubExchange::new();
        stub.set_ticker(105.5, 110.0, 100.0, 105.4, 105.6);
        let engine = engine_with(stub.clone(), grid_overrides());

        engine.ctx().tick().await.unwrap();
        let buy_id = engine.ctx().levels.lock().unwrap()[3].buy_order_id.clone().unwrap();
        stub.fill_order(&buy_id, now_ms());
        engine.ctx().tick().await.unwrap();

        let sell_id = engine.ctx().levels.lock().unwrap()[3].sell_order_id.clone().unwrap();
        stub.fill_order(&sell_id, now_ms());
        engine.ctx().tick().await.unwrap();

        // gross = (104 − 103) * 0.0971 = 0.0971; fee = 2 * 10 * 0.0002.
        let realized = *engine.ctx().realized_pnl.lock().unwrap();
        assert!((realized - (0.0971 - 0.004)).abs() < 1e-9);

        let events = engine.events(30);
        assert!(events.iter().any(|e| e.kind == EventKind::GridSellFilled));

        // The rung cycled back through empty and, still sitting below the
        // mark, was re-bought by the placement phase of the same tick.
        let levels = engine.ctx().levels.lock().unwrap();
        assert_eq!(levels[3].state, LevelState::BuyPending);
        assert_ne!(levels[3].buy_order_id.as_deref(), Some(buy_id.as_str()));
        assert!(levels[3].sell_order_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_sell_exposes_orphaned_inventory() {
        let stub = StubExchange::new();
        stub.set_ticker(105.5, 110.0, 100.0, 105.4, 105.6);
        let engine = engine_with(stub.clone(), grid_overrides());

        engine.ctx().tick().await.unwrap();
        let buy_id = engine.ctx().levels.lock().unwrap()[3].buy_order_id.clone().unwrap();
        stub.fill_order(&buy_id, now_ms());
        engine.ctx().tick().await.unwrap();

        let sell_id = engine.ctx().levels.lock().unwrap()[3].sell_order_id.clone().unwrap();
        stub.cancel_order_externally(&sell_id);
        engine.ctx().tick().await.unwrap();

        let events = engine.events(30);
        let orphan = events
            .iter()
            .find(|e| e.kind == EventKind::GridLevelUpdated)
            .expect("orphan event must be emitted");
        assert_eq!(orphan.data["orphaned_size"], "0.0971");
        assert_eq!(orphan.data["reason"], "sell_cancelled_after_fill");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_buy_resets_rung() {
        let stub = StubExchange::new();
        stub.set_ticker(105.5, 110.0, 100.0, 105.4, 105.6);
        let engine = engine_with(stub.clone(), grid_overrides());

        engine.ctx().tick().await.unwrap();
        let buy_id = engine.ctx().levels.lock().unwrap()[2].buy_order_id.clone().unwrap();
        stub.cancel_order_externally(&buy_id);
        engine.ctx().tick().await.unwrap();

        // Reset to empty during reconcile, then re-bought later in the same
        // tick's placement phase.
        let levels = engine.ctx().levels.lock().unwrap();
        assert_eq!(levels[2].state, LevelState::BuyPending);
        assert_ne!(levels[2].buy_order_id.as_deref(), Some(buy_id.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_risk_denial_halts_buying() {
        let stub = StubExchange::new();
        stub.set_ticker(105.5, 110.0, 100.0, 105.4, 105.6);
        let engine = engine_with(stub.clone(), grid_overrides());
        *engine.ctx().risk.lock().unwrap() = Some(RiskController::new(
            RiskLimits {
                max_drawdown_percent: 50.0,
                max_daily_loss: 1_000_000.0,
                max_position: 0.0,
                cooldown_ms: 1000,
            },
            10_000.0,
            now_ms(),
        ));

        engine.ctx().tick().await.unwrap();
        assert_eq!(stub.placed_count(), 0);
        let events = engine.events(10);
        assert_eq!(
            events.iter().filter(|e| e.kind == EventKind::RiskLimitHit).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_sell_failure_rolls_back_to_buy_filled() {
        let stub = StubExchange::new();
        stub.set_ticker(105.5, 110.0, 100.0, 105.4, 105.6);
        let engine = engine_with(stub.clone(), grid_overrides());

        engine.ctx().tick().await.unwrap();
        let buy_id = engine.ctx().levels.lock().unwrap()[3].buy_order_id.clone().unwrap();
        stub.fill_order(&buy_id, now_ms());

        for _ in 0..3 {
            stub.push_place_error(EngineError::Business {
                code: "22002".into(),
                msg: "No position to close".into(),
            });
        }
        engine.ctx().tick().await.unwrap();

        let levels = engine.ctx().levels.lock().unwrap();
        assert_eq!(levels[3].state, LevelState::BuyFilled);
        assert!(levels[3].sell_order_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_cancels_and_resets() {
        let stub = StubExchange::new();
        stub.set_ticker(105.5, 110.0, 100.0, 105.4, 105.6);
        let engine = engine_with(stub.clone(), grid_overrides());

        engine.ctx().tick().await.unwrap();
        assert!(stub.placed_count() > 0);

        engine.emergency_stop().await.unwrap();

        assert_eq!(engine.status(), EngineStatus::Stopped);
        let levels = engine.ctx().levels.lock().unwrap();
        assert!(levels.iter().all(|l| l.state == LevelState::Empty));
        drop(levels);
        assert!(engine.ctx().tracker.lock().unwrap().pending_ids().is_empty());
        assert!(engine.events(10).iter().any(|e| e.kind == EventKind::EmergencyStop));
    }

    #[test]
    fn test_adopt_orders_reattaches_by_price() {
        let cfg = match ConfigManager::new(StrategyKind::Grid, &grid_overrides())
            .unwrap()
            .snapshot()
        {
            StrategyConfig::Grid(c) => c,
            _ => unreachable!(),
        };
        let mut levels = build_levels(&cfg, &test_spec()).unwrap();
        let orders = vec![
            TrackedOrder {
                order_id: "b1".into(),
                client_oid: "c1".into(),
                side: Side::Buy,
                price: "102.00".into(),
                size: "0.0980".into(),
                status: OrderStatus::Pending,
                linked_order_id: None,
                direction: TradeDirection::Long,
                created_at: 1,
                filled_at: None,
            },
            TrackedOrder {
                order_id: "s1".into(),
                client_oid: "c2".into(),
                side: Side::Sell,
                price: "104.00".into(),
                size: "0.0971".into(),
                status: OrderStatus::Pending,
                linked_order_id: None,
                direction: TradeDirection::Long,
                created_at: 2,
                filled_at: None,
            },
        ];
        adopt_orders(&mut levels, &orders);
        assert_eq!(levels[2].state, LevelState::BuyPending);
        assert_eq!(levels[2].buy_order_id.as_deref(), Some("b1"));
        // The sell at 104 covers inventory bought at rung 3.
        assert_eq!(levels[3].state, LevelState::SellPending);
        assert_eq!(levels[3].sell_order_id.as_deref(), Some("s1"));
    }
}
