// ─────────────────────────────────────────────────────────────────────────────
// scalping.rs — bid-tracking maker ladder
//
// Two loops share the tracker and risk state:
//   Loop A (quote tracker)   — keeps at most one resting buy near the best
//                              bid, repricing when the bid walks away.
//   Loop B (fill reconciler) — diffs local pending orders against the
//                              exchange, drives fill/cancel transitions,
//                              triggers merges and refreshes equity.
// Each buy fill spawns an independent pairing task that places the sell leg
// at buyPrice + priceSpread after the venue settles the inventory.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::config::{ConfigManager, HoldMode, ScalpingConfig, StrategyConfig, StrategyKind};
use crate::error::{EngineError, Result};
use crate::events::{EventKind, EventLog, StrategyEvent};
use crate::instruments::{InstrumentSpec, SpecCache, VenueKind};
use crate::manager::{EngineState, EngineStatus, StrategyEngine};
use crate::merge::MergeEngine;
use crate::persistence::{OrderContext, PersistenceWorker};
use crate::risk::{RiskController, RiskLimits, RiskVerdict};
use crate::services::{OrderRequest, TimeInForce, TradeSide, TradingServices};
use crate::tracker::{
    map_exchange_state, ExchangeOrderState, OrderStatus, OrderTracker, Side, TrackedOrder,
    TradeDirection,
};

/// A resting buy younger than this is never repriced, so a post-only order
/// gets a chance to rest before we churn it.
const BUY_REPRICE_GRACE_MS: i64 = 3000;
/// After an exchange-initiated buy cancel, hold off re-quoting this long.
const POST_ONLY_COOLDOWN_MS: i64 = 3000;
/// At this many consecutive post-only cancels the next buy goes out gtc.
const GTC_FALLBACK_AT: u32 = 5;
/// Offset below bid grows with consecutive cancels, capped here.
const MAX_OFFSET_TICKS: u32 = 10;

/// Derivatives positions take a moment to settle after a fill; selling
/// immediately draws error 22002.
const SETTLE_DELAY_MS: u64 = 3000;
const SELL_MAX_ATTEMPTS: usize = 7;
const SELL_RETRY_DELAY_S: [u64; SELL_MAX_ATTEMPTS] = [2, 3, 4, 5, 5, 3, 0];

const CONSECUTIVE_ERROR_LIMIT: u32 = 5;
const ERROR_RECOVERY_DELAY_S: u64 = 30;
const EMERGENCY_CANCEL_BATCH: usize = 50;
const MIN_POLL_INTERVAL_MS: u64 = 200;
const MIN_CHECK_INTERVAL_MS: u64 = 500;

/// Spread-to-fee ratio below which the strategy loses money on round trips.
const FEE_COVERAGE_RATIO: f64 = 200_000.0;
const FEE_REFERENCE_PRICE: f64 = 70_000.0;

pub struct ScalpEngine {
    ctx: Arc<ScalpCtx>,
}

pub(crate) struct ScalpCtx {
    pub(crate) services: TradingServices,
    pub(crate) specs: Arc<SpecCache>,
    pub(crate) persistence: PersistenceWorker,
    pub(crate) config: Mutex<ConfigManager>,
    pub(crate) spec: Mutex<Option<InstrumentSpec>>,
    pub(crate) tracker: Arc<Mutex<OrderTracker>>,
    pub(crate) risk: Mutex<Option<RiskController>>,
    pub(crate) events: Mutex<EventLog>,
    pub(crate) merge: MergeEngine,
    pub(crate) status: Mutex<EngineStatus>,
    /// Replaced on every start so stale loops from a previous run can never
    /// resume after a stop/start cycle.
    run_flag: Mutex<Arc<AtomicBool>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    pub(crate) consecutive_post_only_cancels: AtomicU32,
    pub(crate) last_buy_cancelled_at: AtomicI64,
    risk_denied_edge: AtomicBool,
    pub(crate) error_count: AtomicU32,
    pub(crate) last_error: Mutex<Option<String>>,
    pub(crate) realized_pnl: Mutex<f64>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ScalpEngine {
    pub fn new(
        services: TradingServices,
        specs: Arc<SpecCache>,
        persistence: PersistenceWorker,
        config: ConfigManager,
    ) -> Result<Self> {
        if config.get().kind() != StrategyKind::Scalping {
            return Err(EngineError::ConfigInvalid(
                "scalping engine requires a scalping config".into(),
            ));
        }
        Ok(Self {
            ctx: Arc::new(ScalpCtx {
                services,
                specs,
                persistence,
                config: Mutex::new(config),
                spec: Mutex::new(None),
                tracker: Arc::new(Mutex::new(OrderTracker::new())),
                risk: Mutex::new(None),
                events: Mutex::new(EventLog::new()),
                merge: MergeEngine::new(),
                status: Mutex::new(EngineStatus::Stopped),
                run_flag: Mutex::new(Arc::new(AtomicBool::new(true))),
                tasks: Mutex::new(Vec::new()),
                consecutive_post_only_cancels: AtomicU32::new(0),
                last_buy_cancelled_at: AtomicI64::new(0),
                risk_denied_edge: AtomicBool::new(false),
                error_count: AtomicU32::new(0),
                last_error: Mutex::new(None),
                realized_pnl: Mutex::new(0.0),
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn ctx(&self) -> &Arc<ScalpCtx> {
        &self.ctx
    }
}

impl ScalpCtx {
    pub(crate) fn scalping_config(&self) -> ScalpingConfig {
        match self.config.lock().unwrap().snapshot() {
            StrategyConfig::Scalping(c) => c,
            StrategyConfig::Grid(_) => unreachable!("constructor enforces the variant"),
        }
    }

    pub(crate) fn current_spec(&self) -> Result<InstrumentSpec> {
        self.spec
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EngineError::NotRunning)
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub(crate) fn get_status(&self) -> EngineStatus {
        *self.status.lock().unwrap()
    }

    pub(crate) fn emit(&self, kind: EventKind, data: Value) {
        log::info!("[SCALP] {:?} {}", kind, data);
        self.events.lock().unwrap().emit(kind, data);
    }

    fn order_ctx(&self) -> OrderContext {
        let cfg = self.scalping_config();
        OrderContext {
            symbol: cfg.base.symbol.clone(),
            venue_code: self.services.venue.code().to_string(),
            margin_coin: cfg.base.margin_coin.clone().unwrap_or_else(|| "USDT".into()),
            strategy_type: StrategyKind::Scalping.as_str().to_string(),
            trading_type: self.services.venue.as_str().to_string(),
        }
    }

    fn direction(&self) -> TradeDirection {
        self.scalping_config().base.direction.unwrap_or(TradeDirection::Long)
    }

    /// tradeSide for an entry order: hedge mode opens explicitly, one-way
    /// mode and spot omit the field.
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

    /// The attempt-6 fallback: the opposite of what detection said.
    fn inverted_exit_trade_side(&self) -> Option<TradeSide> {
        match (self.services.venue, self.services.hold_mode) {
            (VenueKind::Derivatives, HoldMode::DoubleHold) => None,
            (VenueKind::Derivatives, HoldMode::SingleHold) => Some(TradeSide::Close),
            _ => None,
        }
    }

    // ─── Loop A: quote tracker ───────────────────────────────────────────────

    pub(crate) async fn quote_tick(&self) -> Result<()> {
        let cfg = self.scalping_config();
        let spec = self.current_spec()?;
        let symbol = cfg.base.symbol.clone();
        let now = now_ms();

        // Risk gate on current exposure.
        let position = self.tracker.lock().unwrap().position_notional();
        let verdict = match self.risk.lock().unwrap().as_mut() {
            Some(risk) => risk.check_can_trade(now, position),
            None => RiskVerdict::Allowed,
        };
        if let RiskVerdict::Denied { reason } = verdict {
            if !self.risk_denied_edge.swap(true, Ordering::SeqCst) {
                self.emit(EventKind::RiskLimitHit, json!({ "reason": reason }));
            }
            return Ok(());
        }
        self.risk_denied_edge.store(false, Ordering::SeqCst);

        let bid = self.services.market.best_bid(&symbol).await?;

        let active = self.tracker.lock().unwrap().active_buy();
        if let Some(buy) = active {
            self.maybe_reprice(&cfg, &buy, bid, now).await?;
            return Ok(());
        }

        // Back off briefly after an exchange-initiated cancel; immediate
        // re-quotes just get cancelled again.
        let cancelled_at = self.last_buy_cancelled_at.load(Ordering::SeqCst);
        if cancelled_at > 0 && now - cancelled_at < POST_ONLY_COOLDOWN_MS {
            return Ok(());
        }

        self.place_buy(&cfg, &spec, bid, now).await
    }

    async fn maybe_reprice(
        &self,
        cfg: &ScalpingConfig,
        buy: &TrackedOrder,
        bid: f64,
        now: i64,
    ) -> Result<()> {
        if now - buy.created_at < BUY_REPRICE_GRACE_MS {
            return Ok(());
        }
        let price = buy.price_f64();
        let spread = cfg.price_spread;
        let overpaying = price > bid + 2.0 * spread;
        let lagging = bid - price > 5.0 * spread;
        if !overpaying && !lagging {
            return Ok(());
        }
        self.services
            .order
            .cancel_order(&cfg.base.symbol, &buy.order_id)
            .await?;
        self.tracker.lock().unwrap().mark_cancelled(&buy.order_id);
        self.persistence
            .persist_order_status_change(&buy.order_id, OrderStatus::Cancelled, None, None);
        self.emit(
            EventKind::BuyOrderCancelled,
            json!({
                "order_id": buy.order_id,
                "reason": if overpaying { "above_bid_band" } else { "below_bid_band" },
                "order_price": buy.price,
                "bid": bid,
            }),
        );
        Ok(())
    }

    async fn place_buy(
        &self,
        cfg: &ScalpingConfig,
        spec: &InstrumentSpec,
        bid: f64,
        now: i64,
    ) -> Result<()> {
        let cancels = self.consecutive_post_only_cancels.load(Ordering::SeqCst);
        let offset_ticks = (2 + cancels).min(MAX_OFFSET_TICKS);
        let price = bid - spec.tick_size() * offset_ticks as f64;
        let price_str = spec.format_price(price);

        let Some(size_str) = spec.calc_size(cfg.base.notional, price) else {
            log::warn!(
                "[SCALP] notional {} at price {} is below the tradable minimum, skipping",
                cfg.base.notional, price_str
            );
            return Ok(());
        };

        // After enough post-only rejections, accept taker risk to get set.
        let force = if cancels >= GTC_FALLBACK_AT { TimeInForce::Gtc } else { TimeInForce::PostOnly };
        let client_oid = format!("scalp-{}", uuid::Uuid::new_v4().simple());
        let request = OrderRequest::limit(&cfg.base.symbol, Side::Buy, &price_str, &size_str, force)
            .with_trade_side(self.entry_trade_side())
            .with_client_oid(client_oid.clone());

        let placed = self.services.order.place_order(&request).await?;
        let order = TrackedOrder {
            order_id: placed.order_id.clone(),
            client_oid,
            side: Side::Buy,
            price: price_str.clone(),
            size: size_str.clone(),
            status: OrderStatus::Pending,
            linked_order_id: None,
            direction: self.direction(),
            created_at: now,
            filled_at: None,
        };
        self.tracker.lock().unwrap().insert(order.clone());
        self.persistence.persist_new_order(&order, self.order_ctx());
        self.emit(
            EventKind::BuyOrderPlaced,
            json!({
                "order_id": placed.order_id,
                "price": price_str,
                "size": size_str,
                "force": force.as_str(),
                "offset_ticks": offset_ticks,
            }),
        );
        Ok(())
    }

    // ─── Loop B: fill reconciler ─────────────────────────────────────────────

    pub(crate) async fn reconcile_tick(ctx: &Arc<ScalpCtx>, run_flag: &Arc<AtomicBool>) -> Result<()> {
        let cfg = ctx.scalping_config();
        let spec = ctx.current_spec()?;
        let symbol = cfg.base.symbol.clone();

        // Snapshot local pending ids *before* asking the exchange, so an
        // order placed mid-fetch cannot look disappeared.
        let snapshot = ctx.tracker.lock().unwrap().pending_ids();
        let exchange_pending: HashSet<String> = ctx
            .services
            .order
            .pending_orders(&symbol)
            .await?
            .into_iter()
            .map(|o| o.order_id)
            .collect();
        let disappeared = ctx
            .tracker
            .lock()
            .unwrap()
            .find_disappeared(&snapshot, &exchange_pending);

        for order in disappeared {
            let detail = match ctx.services.order.order_detail(&symbol, &order.order_id).await {
                Ok(d) => d,
                Err(e) => {
                    // Stays pending; absence alone is never a fill.
                    log::warn!("[RECONCILE] detail lookup failed for {}: {}", order.order_id, e);
                    continue;
                }
            };
            match map_exchange_state(&detail.state) {
                ExchangeOrderState::Live | ExchangeOrderState::PartiallyFilled => {
                    // Query lag between the pending list and the detail view.
                }
                ExchangeOrderState::Filled => {
                    let filled_at = detail.updated_at.unwrap_or_else(now_ms);
                    if ctx.tracker.lock().unwrap().mark_filled(&order.order_id, filled_at) {
                        ctx.persistence.persist_order_status_change(
                            &order.order_id,
                            OrderStatus::Filled,
                            Some(filled_at),
                            None,
                        );
                        match order.side {
                            Side::Buy => ScalpCtx::on_buy_filled(ctx, order.clone(), run_flag),
                            Side::Sell => ctx.on_sell_filled(&order),
                        }
                    }
                }
                ExchangeOrderState::Cancelled => {
                    if ctx.tracker.lock().unwrap().mark_cancelled(&order.order_id) {
                        ctx.persistence.persist_order_status_change(
                            &order.order_id,
                            OrderStatus::Cancelled,
                            None,
                            None,
                        );
                        if order.side == Side::Buy {
                            ctx.last_buy_cancelled_at.store(now_ms(), Ordering::SeqCst);
                            ctx.consecutive_post_only_cancels.fetch_add(1, Ordering::SeqCst);
                            ctx.emit(
                                EventKind::BuyOrderCancelled,
                                json!({ "order_id": order.order_id, "reason": "exchange_cancelled" }),
                            );
                        } else {
                            log::warn!(
                                "[RECONCILE] sell {} cancelled by the exchange, pairing lost",
                                order.order_id
                            );
                        }
                    }
                }
            }
        }

        // Saturated sell ladder → merge the oldest tail.
        if ctx.tracker.lock().unwrap().pending_sell_count() >= cfg.max_pending_orders {
            match ctx
                .merge
                .run(
                    &ctx.services.order,
                    &ctx.tracker,
                    &spec,
                    cfg.merge_threshold,
                    ctx.exit_trade_side(),
                    ctx.direction(),
                )
                .await
            {
                Ok(Some(outcome)) => {
                    for id in &outcome.cancelled {
                        ctx.persistence.persist_order_status_change(
                            id,
                            OrderStatus::Cancelled,
                            None,
                            None,
                        );
                    }
                    if let Some(new_id) = &outcome.new_order_id {
                        if let Some(order) = ctx.tracker.lock().unwrap().get(new_id).cloned() {
                            ctx.persistence.persist_new_order(&order, ctx.order_ctx());
                        }
                    }
                    ctx.emit(
                        EventKind::OrdersMerged,
                        json!({
                            "merged_count": outcome.merged_count,
                            "new_order_id": outcome.new_order_id,
                            "avg_price": outcome.avg_price,
                            "total_size": outcome.total_size,
                            "source_order_ids": outcome.source_order_ids,
                        }),
                    );
                }
                Ok(None) => {}
                Err(e) => log::warn!("[MERGE] failed: {}", e),
            }
        }

        ctx.tracker.lock().unwrap().cleanup();

        let equity = ctx.services.account.account_equity(&symbol).await?;
        if let Some(risk) = ctx.risk.lock().unwrap().as_mut() {
            risk.update_equity(equity.equity);
        }
        Ok(())
    }

    // ─── Fill handlers ───────────────────────────────────────────────────────

    fn on_buy_filled(ctx: &Arc<ScalpCtx>, buy: TrackedOrder, run_flag: &Arc<AtomicBool>) {
        ctx.consecutive_post_only_cancels.store(0, Ordering::SeqCst);
        ctx.emit(
            EventKind::BuyOrderFilled,
            json!({ "order_id": buy.order_id, "price": buy.price, "size": buy.size }),
        );
        // Pairing is per-buy and independent; two concurrent fills race
        // freely and that is fine.
        let pair_ctx = ctx.clone();
        let flag = run_flag.clone();
        tokio::spawn(async move {
            pair_ctx.pair_sell(buy, flag).await;
        });
    }

    /// Places the sell leg for a filled buy. Retries only the two business
    /// codes that mean the position has not settled or the tradeSide choice
    /// was wrong; everything else fails immediately.
    pub(crate) async fn pair_sell(&self, buy: TrackedOrder, run_flag: Arc<AtomicBool>) {
        let cfg = self.scalping_config();
        let Ok(spec) = self.current_spec() else { return };
        let sell_price = spec.format_price(buy.price_f64() + cfg.price_spread);

        tokio::time::sleep(std::time::Duration::from_millis(SETTLE_DELAY_MS)).await;

        for attempt in 0..SELL_MAX_ATTEMPTS {
            if !run_flag.load(Ordering::SeqCst) {
                log::info!("[SCALP] pairing for {} abandoned on stop", buy.order_id);
                return;
            }
            let request = match attempt {
                0..=4 => OrderRequest::limit(
                    &cfg.base.symbol,
                    Side::Sell,
                    &sell_price,
                    &buy.size,
                    TimeInForce::PostOnly,
                )
                .with_trade_side(self.exit_trade_side()),
                5 => OrderRequest::limit(
                    &cfg.base.symbol,
                    Side::Sell,
                    &sell_price,
                    &buy.size,
                    TimeInForce::PostOnly,
                )
                .with_trade_side(self.inverted_exit_trade_side()),
                _ => OrderRequest::market(&cfg.base.symbol, Side::Sell, &buy.size)
                    .with_trade_side(Some(TradeSide::Close)),
            }
            .with_client_oid(format!("pair-{}", uuid::Uuid::new_v4().simple()));

            match self.services.order.place_order(&request).await {
                Ok(placed) => {
                    let order = TrackedOrder {
                        order_id: placed.order_id.clone(),
                        client_oid: request.client_oid.clone().unwrap_or_default(),
                        side: Side::Sell,
                        price: sell_price.clone(),
                        size: buy.size.clone(),
                        status: OrderStatus::Pending,
                        linked_order_id: Some(buy.order_id.clone()),
                        direction: buy.direction,
                        created_at: now_ms(),
                        filled_at: None,
                    };
                    {
                        let mut tracker = self.tracker.lock().unwrap();
                        tracker.insert(order.clone());
                        tracker.link(&buy.order_id, &placed.order_id);
                    }
                    self.persistence.persist_new_order(&order, self.order_ctx());
                    self.persistence.persist_order_status_change(
                        &buy.order_id,
                        OrderStatus::Filled,
                        None,
                        Some(placed.order_id.clone()),
                    );
                    self.emit(
                        EventKind::SellOrderPlaced,
                        json!({
                            "order_id": placed.order_id,
                            "linked_buy": buy.order_id,
                            "price": sell_price,
                            "size": buy.size,
                            "attempt": attempt + 1,
                        }),
                    );
                    return;
                }
                Err(e) if e.is_position_retryable() && attempt + 1 < SELL_MAX_ATTEMPTS => {
                    log::warn!(
                        "[SCALP] sell attempt {}/{} for {} rejected ({}), retrying",
                        attempt + 1, SELL_MAX_ATTEMPTS, buy.order_id, e
                    );
                    let delay = SELL_RETRY_DELAY_S[attempt];
                    if delay > 0 {
                        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                    }
                }
                Err(e) => {
                    log::error!("[SCALP] sell placement for {} failed: {}", buy.order_id, e);
                    self.emit(
                        EventKind::SellOrderFailed,
                        json!({
                            "linked_buy": buy.order_id,
                            "error": e.to_string(),
                            "attempt": attempt + 1,
                        }),
                    );
                    return;
                }
            }
        }
    }

    pub(crate) fn on_sell_filled(&self, sell: &TrackedOrder) {
        let spec = match self.current_spec() {
            Ok(s) => s,
            Err(_) => return,
        };
        let buy_price = sell
            .linked_order_id
            .as_deref()
            .and_then(|id| self.tracker.lock().unwrap().get(id).map(|o| o.price_f64()));

        let Some(buy_price) = buy_price else {
            // A merged sell carries no linkage; its pnl was realized across
            // the source orders and cannot be attributed here.
            log::info!("[SCALP] unlinked sell {} filled at {}", sell.order_id, sell.price);
            self.emit(
                EventKind::SellOrderFilled,
                json!({ "order_id": sell.order_id, "price": sell.price, "net_pnl": Value::Null }),
            );
            return;
        };

        let size = sell.size_f64();
        let sell_price = sell.price_f64();
        let gross = (sell_price - buy_price) * size;
        let fee = 2.0 * (sell_price * size) * spec.maker_fee_rate;
        let net = gross - fee;

        *self.realized_pnl.lock().unwrap() += net;
        if let Some(risk) = self.risk.lock().unwrap().as_mut() {
            risk.record_pnl(net);
        }
        self.persistence.persist_realized_pnl(net, fee, net >= 0.0, StrategyKind::Scalping.as_str());
        self.emit(
            EventKind::SellOrderFilled,
            json!({
                "order_id": sell.order_id,
                "buy_price": buy_price,
                "sell_price": sell_price,
                "size": sell.size,
                "gross_pnl": gross,
                "fee": fee,
                "net_pnl": net,
            }),
        );
    }

    // ─── Error policy ────────────────────────────────────────────────────────

    /// Counts a loop-body failure. Five in a row flip the engine to ERROR
    /// and a timer restores RUNNING after 30 s. Returns true when the error
    /// state was entered on this call.
    fn note_loop_error(
        ctx: &Arc<ScalpCtx>,
        loop_name: &str,
        e: &EngineError,
        consecutive: u32,
        run_flag: &Arc<AtomicBool>,
    ) -> bool {
        ctx.error_count.fetch_add(1, Ordering::SeqCst);
        *ctx.last_error.lock().unwrap() = Some(e.to_string());
        log::error!("[SCALP] {} loop error ({} consecutive): {}", loop_name, consecutive, e);

        if e.is_terminal() {
            log::error!("[SCALP] auth failure is terminal, stopping the engine");
            run_flag.store(false, Ordering::SeqCst);
            ctx.set_status(EngineStatus::Stopped);
            ctx.emit(EventKind::StrategyStopped, json!({ "reason": "auth_failure" }));
            return false;
        }

        if consecutive >= CONSECUTIVE_ERROR_LIMIT && ctx.get_status() == EngineStatus::Running {
            ctx.set_status(EngineStatus::Error);
            ctx.emit(
                EventKind::StrategyError,
                json!({ "loop": loop_name, "error": e.to_string(), "consecutive": consecutive }),
            );
            let recover_ctx = ctx.clone();
            let flag = run_flag.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(ERROR_RECOVERY_DELAY_S)).await;
                if flag.load(Ordering::SeqCst) && recover_ctx.get_status() == EngineStatus::Error {
                    log::info!("[SCALP] attempting recovery from ERROR");
                    recover_ctx.set_status(EngineStatus::Running);
                }
            });
            return true;
        }
        false
    }

    fn fee_coverage_note(&self, cfg: &ScalpingConfig, spec: &InstrumentSpec) -> Option<String> {
        let fee_sum = spec.maker_fee_rate + spec.taker_fee_rate;
        if fee_sum <= 0.0 || cfg.price_spread / fee_sum >= FEE_COVERAGE_RATIO {
            return None;
        }
        let size = cfg.base.notional / FEE_REFERENCE_PRICE;
        let per_trade = cfg.price_spread * size - 2.0 * cfg.base.notional * spec.maker_fee_rate;
        let note = format!(
            "price_spread {} may not cover round-trip fees (maker {} + taker {}); \
             estimated net per trade at a {} reference price: {:.6}",
            cfg.price_spread, spec.maker_fee_rate, spec.taker_fee_rate, FEE_REFERENCE_PRICE, per_trade
        );
        log::warn!("[SCALP] {}", note);
        Some(note)
    }
}

#[async_trait::async_trait]
impl StrategyEngine for ScalpEngine {
    async fn start(&self) -> Result<()> {
        let ctx = &self.ctx;
        match ctx.get_status() {
            EngineStatus::Starting | EngineStatus::Running => return Err(EngineError::AlreadyRunning),
            _ => {}
        }
        ctx.set_status(EngineStatus::Starting);

        let started = async {
            let cfg = ctx.scalping_config();
            let symbol = cfg.base.symbol.clone();

            let spec = ctx.specs.get_spec(&symbol, ctx.services.venue).await?;
            ctx.config
                .lock()
                .unwrap()
                .apply_spec_precision(spec.price_place, spec.volume_place);
            *ctx.spec.lock().unwrap() = Some(spec.clone());

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

            // Re-adopt whatever was resting when the last run ended.
            match ctx
                .persistence
                .load_pending_orders(&symbol, ctx.services.venue.code())
                .await
            {
                Ok(recovered) => {
                    if !recovered.is_empty() {
                        log::info!("[SCALP] recovered {} pending orders", recovered.len());
                        let mut tracker = ctx.tracker.lock().unwrap();
                        for order in recovered {
                            tracker.insert(order);
                        }
                    }
                }
                Err(e) => log::warn!("[SCALP] pending-order recovery failed: {}", e),
            }

            let fee_note = ctx.fee_coverage_note(&ctx.scalping_config(), &spec);
            ctx.emit(
                EventKind::StrategyStarted,
                json!({
                    "symbol": symbol,
                    "instance_id": cfg.base.instance_id,
                    "trading_type": ctx.services.venue.as_str(),
                    "hold_mode": format!("{:?}", ctx.services.hold_mode),
                    "equity": equity.equity,
                    "fee_warning": fee_note,
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

        let cfg = ctx.scalping_config();
        let poll_ms = cfg.base.poll_interval_ms.max(MIN_POLL_INTERVAL_MS);
        let check_ms = cfg.base.order_check_interval_ms.max(MIN_CHECK_INTERVAL_MS);

        let quote_ctx = ctx.clone();
        let quote_flag = run_flag.clone();
        let quote = tokio::spawn(async move {
            let mut consecutive = 0u32;
            loop {
                if !quote_flag.load(Ordering::SeqCst) {
                    break;
                }
                if quote_ctx.get_status() == EngineStatus::Running {
                    match quote_ctx.quote_tick().await {
                        Ok(()) => consecutive = 0,
                        Err(e) => {
                            consecutive += 1;
                            if ScalpCtx::note_loop_error(&quote_ctx, "quote", &e, consecutive, &quote_flag) {
                                consecutive = 0;
                            }
                        }
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(poll_ms)).await;
            }
        });

        let rec_ctx = ctx.clone();
        let rec_flag = run_flag.clone();
        let reconcile = tokio::spawn(async move {
            let mut consecutive = 0u32;
            loop {
                if !rec_flag.load(Ordering::SeqCst) {
                    break;
                }
                if rec_ctx.get_status() == EngineStatus::Running {
                    match ScalpCtx::reconcile_tick(&rec_ctx, &rec_flag).await {
                        Ok(()) => consecutive = 0,
                        Err(e) => {
                            consecutive += 1;
                            if ScalpCtx::note_loop_error(&rec_ctx, "reconcile", &e, consecutive, &rec_flag) {
                                consecutive = 0;
                            }
                        }
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(check_ms)).await;
            }
        });

        *ctx.tasks.lock().unwrap() = vec![quote, reconcile];
        ctx.set_status(EngineStatus::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.get_status() == EngineStatus::Stopped {
            return Ok(());
        }
        ctx.set_status(EngineStatus::Stopping);

        // Best-effort: pull the resting buy before the loops die.
        let active = ctx.tracker.lock().unwrap().active_buy();
        if let Some(buy) = active {
            let symbol = ctx.scalping_config().base.symbol;
            match ctx.services.order.cancel_order(&symbol, &buy.order_id).await {
                Ok(()) => {
                    ctx.tracker.lock().unwrap().mark_cancelled(&buy.order_id);
                    ctx.persistence.persist_order_status_change(
                        &buy.order_id,
                        OrderStatus::Cancelled,
                        None,
                        None,
                    );
                }
                Err(e) => log::warn!("[SCALP] could not cancel active buy on stop: {}", e),
            }
        }

        ctx.run_flag.lock().unwrap().store(false, Ordering::SeqCst);
        let tasks: Vec<_> = ctx.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(std::time::Duration::from_secs(10), task)
                .await
                .is_err()
            {
                log::warn!("[SCALP] loop did not drain within 10s, abandoning");
            }
        }

        ctx.set_status(EngineStatus::Stopped);
        ctx.emit(EventKind::StrategyStopped, json!({ "reason": "requested" }));
        Ok(())
    }

    /// Cancels everything in 50-sized batches without waiting for paired
    /// sells; usable from ERROR as well.
    async fn emergency_stop(&self) -> Result<()> {
        let ctx = &self.ctx;
        ctx.run_flag.lock().unwrap().store(false, Ordering::SeqCst);

        let symbol = ctx.scalping_config().base.symbol;
        let pending = ctx.tracker.lock().unwrap().pending_ids();
        let mut cancelled_total = 0usize;
        for chunk in pending.chunks(EMERGENCY_CANCEL_BATCH) {
            match ctx.services.order.batch_cancel(&symbol, chunk).await {
                Ok(result) => {
                    let mut tracker = ctx.tracker.lock().unwrap();
                    for id in &result.cancelled {
                        tracker.mark_cancelled(id);
                        ctx.persistence.persist_order_status_change(
                            id,
                            OrderStatus::Cancelled,
                            None,
                            None,
                        );
                    }
                    cancelled_total += result.cancelled.len();
                }
                Err(e) => log::error!("[SCALP] emergency batch cancel failed: {}", e),
            }
        }

        ctx.set_status(EngineStatus::Stopped);
        ctx.emit(
            EventKind::EmergencyStop,
            json!({ "cancelled": cancelled_total, "requested": pending.len() }),
        );
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
        let cfg = ctx.scalping_config();
        let tracker = ctx.tracker.lock().unwrap();
        let risk = ctx.risk.lock().unwrap();
        let risk_snap = risk.as_ref().map(|r| r.snapshot());
        EngineState {
            status: ctx.get_status(),
            strategy_type: Some(StrategyKind::Scalping),
            instance_id: Some(cfg.base.instance_id.clone()),
            symbol: Some(cfg.base.symbol.clone()),
            realized_pnl: *ctx.realized_pnl.lock().unwrap(),
            daily_pnl: risk_snap.as_ref().map(|r| r.daily_pnl).unwrap_or(0.0),
            total_trades: risk_snap.as_ref().map(|r| r.total_trades).unwrap_or(0),
            win_trades: risk_snap.as_ref().map(|r| r.win_trades).unwrap_or(0),
            loss_trades: risk_snap.as_ref().map(|r| r.loss_trades).unwrap_or(0),
            pending_buys: usize::from(tracker.active_buy().is_some()),
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
