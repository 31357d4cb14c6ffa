// ─────────────────────────────────────────────────────────────────────────────
// services.rs — trading-service abstraction
//
// Three capability traits (order, market data, account), each implemented by
// a derivatives adapter and a spot adapter over the shared REST client. The
// engines depend on the traits only; venue-specific fields (product type,
// margin mode, margin coin, tradeSide) are injected at adapter construction
// and ignored by the spot family.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{BaseConfig, HoldMode};
use crate::error::{EngineError, Result};
use crate::exchange::{field_f64, field_i64, BitgetClient};
use crate::instruments::{VenueKind, PRODUCT_TYPE_USDT_FUTURES};
use crate::tracker::Side;

// ─── Unified request/response types ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    PostOnly,
    Gtc,
    Ioc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::PostOnly => "post_only",
            TimeInForce::Gtc => "gtc",
            TimeInForce::Ioc => "ioc",
        }
    }
}

/// Hedge-mode opening/closing intent. Omitted entirely in one-way mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    Open,
    Close,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Open => "open",
            TradeSide::Close => "close",
        }
    }
}

/// Parameters shared by both adapter families. Spot ignores `trade_side`.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub force: TimeInForce,
    pub price: Option<String>,
    pub size: String,
    pub client_oid: Option<String>,
    pub trade_side: Option<TradeSide>,
}

impl OrderRequest {
    pub fn limit(symbol: &str, side: Side, price: &str, size: &str, force: TimeInForce) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            force,
            price: Some(price.to_string()),
            size: size.to_string(),
            client_oid: None,
            trade_side: None,
        }
    }

    pub fn market(symbol: &str, side: Side, size: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            force: TimeInForce::Ioc,
            price: None,
            size: size.to_string(),
            client_oid: None,
            trade_side: None,
        }
    }

    pub fn with_trade_side(mut self, trade_side: Option<TradeSide>) -> Self {
        self.trade_side = trade_side;
        self
    }

    pub fn with_client_oid(mut self, client_oid: String) -> Self {
        self.client_oid = Some(client_oid);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
    pub client_oid: String,
}

#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub order_id: String,
    pub client_oid: String,
    pub price: f64,
    pub size: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct OrderDetail {
    pub order_id: String,
    /// Raw exchange state string; the reconciler maps it.
    pub state: String,
    pub price_avg: Option<f64>,
    pub updated_at: Option<i64>,
}

/// Batch cancellation outcome, partitioned per order.
#[derive(Debug, Clone, Default)]
pub struct BatchCancelResult {
    pub cancelled: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Ticker {
    pub last: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct AccountEquity {
    pub equity: f64,
    pub available: f64,
    pub unrealized_pl: f64,
}

// ─── Capability traits ───────────────────────────────────────────────────────

#[async_trait]
pub trait OrderService: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlacedOrder>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;
    async fn batch_cancel(&self, symbol: &str, order_ids: &[String]) -> Result<BatchCancelResult>;
    async fn pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>>;
    async fn order_detail(&self, symbol: &str, order_id: &str) -> Result<OrderDetail>;
}

#[async_trait]
pub trait MarketDataService: Send + Sync {
    async fn ticker(&self, symbol: &str) -> Result<Ticker>;
    async fn best_bid(&self, symbol: &str) -> Result<f64>;
    async fn best_ask(&self, symbol: &str) -> Result<f64>;
}

#[async_trait]
pub trait AccountService: Send + Sync {
    async fn available_balance(&self, symbol: &str) -> Result<f64>;
    async fn account_equity(&self, symbol: &str) -> Result<AccountEquity>;
}

/// The triple handed to an engine, plus the venue facts resolved at build
/// time.
#[derive(Clone)]
pub struct TradingServices {
    pub order: Arc<dyn OrderService>,
    pub market: Arc<dyn MarketDataService>,
    pub account: Arc<dyn AccountService>,
    pub venue: VenueKind,
    pub hold_mode: HoldMode,
}

// ─── Row parsing (shared by both adapters) ───────────────────────────────────

fn parse_pending_row(row: &Value) -> Option<PendingOrder> {
    Some(PendingOrder {
        order_id: row["orderId"].as_str()?.to_string(),
        client_oid: row["clientOid"].as_str().unwrap_or_default().to_string(),
        price: field_f64(row, "price").or_else(|| field_f64(row, "priceAvg")).unwrap_or(0.0),
        size: field_f64(row, "size").unwrap_or(0.0),
        created_at: field_i64(row, "cTime").unwrap_or(0),
    })
}

fn parse_detail(row: &Value) -> Option<OrderDetail> {
    let state = row["state"]
        .as_str()
        .or_else(|| row["status"].as_str())?
        .to_string();
    Some(OrderDetail {
        order_id: row["orderId"].as_str().unwrap_or_default().to_string(),
        state,
        price_avg: field_f64(row, "priceAvg"),
        updated_at: field_i64(row, "uTime"),
    })
}

fn parse_ticker_row(row: &Value) -> Ticker {
    Ticker {
        last: field_f64(row, "lastPr").unwrap_or(0.0),
        high_24h: field_f64(row, "high24h").unwrap_or(0.0),
        low_24h: field_f64(row, "low24h").unwrap_or(0.0),
        bid: field_f64(row, "bidPr"),
        ask: field_f64(row, "askPr"),
    }
}

fn parse_batch_result(data: &Value) -> BatchCancelResult {
    let mut out = BatchCancelResult::default();
    if let Some(rows) = data["successList"].as_array() {
        for row in rows {
            if let Some(id) = row["orderId"].as_str() {
                out.cancelled.push(id.to_string());
            }
        }
    }
    if let Some(rows) = data["failureList"].as_array() {
        for row in rows {
            let id = row["orderId"].as_str().unwrap_or_default().to_string();
            let msg = row["errorMsg"].as_str().unwrap_or("unknown").to_string();
            out.failed.push((id, msg));
        }
    }
    out
}

// ─── Derivatives adapter ─────────────────────────────────────────────────────

pub struct DerivativesAdapter {
    client: Arc<BitgetClient>,
    product_type: String,
    margin_mode: String,
    margin_coin: String,
}

impl DerivativesAdapter {
    pub fn new(
        client: Arc<BitgetClient>,
        product_type: String,
        margin_mode: String,
        margin_coin: String,
    ) -> Self {
        Self { client, product_type, margin_mode, margin_coin }
    }
}

#[async_trait]
impl OrderService for DerivativesAdapter {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlacedOrder> {
        let mut body = json!({
            "symbol": req.symbol,
            "productType": self.product_type,
            "marginMode": self.margin_mode,
            "marginCoin": self.margin_coin,
            "side": req.side.as_str(),
            "orderType": req.order_type.as_str(),
            "force": req.force.as_str(),
            "size": req.size,
        });
        if let Some(price) = &req.price {
            body["price"] = json!(price);
        }
        if let Some(trade_side) = req.trade_side {
            body["tradeSide"] = json!(trade_side.as_str());
        }
        if let Some(oid) = &req.client_oid {
            body["clientOid"] = json!(oid);
        }
        let data = self.client.post_signed("/api/v2/mix/order/place-order", &body).await?;
        Ok(PlacedOrder {
            order_id: data["orderId"].as_str().unwrap_or_default().to_string(),
            client_oid: data["clientOid"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "orderId": order_id,
        });
        self.client.post_signed("/api/v2/mix/order/cancel-order", &body).await?;
        Ok(())
    }

    async fn batch_cancel(&self, symbol: &str, order_ids: &[String]) -> Result<BatchCancelResult> {
        let list: Vec<Value> = order_ids.iter().map(|id| json!({ "orderId": id })).collect();
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "orderIdList": list,
        });
        let data = self.client.post_signed("/api/v2/mix/order/batch-cancel-orders", &body).await?;
        Ok(parse_batch_result(&data))
    }

    async fn pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>> {
        let data = self
            .client
            .get_signed(
                "/api/v2/mix/order/orders-pending",
                &[("symbol", symbol.to_string()), ("productType", self.product_type.clone())],
            )
            .await?;
        let rows = data["entrustedList"].as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(parse_pending_row).collect())
    }

    async fn order_detail(&self, symbol: &str, order_id: &str) -> Result<OrderDetail> {
        let data = self
            .client
            .get_signed(
                "/api/v2/mix/order/detail",
                &[
                    ("symbol", symbol.to_string()),
                    ("productType", self.product_type.clone()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        parse_detail(&data)
            .ok_or_else(|| EngineError::Transport(format!("order detail missing state: {}", order_id)))
    }
}

#[async_trait]
impl MarketDataService for DerivativesAdapter {
    async fn ticker(&self, symbol: &str) -> Result<Ticker> {
        let data = self
            .client
            .get_public(
                "/api/v2/mix/market/ticker",
                &[("symbol", symbol.to_string()), ("productType", self.product_type.clone())],
            )
            .await?;
        let row = data
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .ok_or_else(|| EngineError::Transport(format!("empty ticker for {}", symbol)))?;
        Ok(parse_ticker_row(&row))
    }

    async fn best_bid(&self, symbol: &str) -> Result<f64> {
        let (bid, _) = self.top_of_book(symbol).await?;
        bid.ok_or_else(|| EngineError::Transport(format!("empty bid side for {}", symbol)))
    }

    async fn best_ask(&self, symbol: &str) -> Result<f64> {
        let (_, ask) = self.top_of_book(symbol).await?;
        ask.ok_or_else(|| EngineError::Transport(format!("empty ask side for {}", symbol)))
    }
}

impl DerivativesAdapter {
    /// Depth-1 merge-depth snapshot.
    async fn top_of_book(&self, symbol: &str) -> Result<(Option<f64>, Option<f64>)> {
        let data = self
            .client
            .get_public(
                "/api/v2/mix/market/merge-depth",
                &[
                    ("symbol", symbol.to_string()),
                    ("productType", self.product_type.clone()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok((parse_depth_level(&data["bids"]), parse_depth_level(&data["asks"])))
    }
}

fn parse_depth_level(side: &Value) -> Option<f64> {
    side.as_array()?
        .first()?
        .as_array()?
        .first()
        .and_then(|p| p.as_str().and_then(|s| s.parse().ok()).or_else(|| p.as_f64()))
}

#[async_trait]
impl AccountService for DerivativesAdapter {
    async fn available_balance(&self, symbol: &str) -> Result<f64> {
        Ok(self.account_equity(symbol).await?.available)
    }

    async fn account_equity(&self, symbol: &str) -> Result<AccountEquity> {
        let data = self
            .client
            .get_signed(
                "/api/v2/mix/account/account",
                &[
                    ("symbol", symbol.to_string()),
                    ("productType", self.product_type.clone()),
                    ("marginCoin", self.margin_coin.clone()),
                ],
            )
            .await?;
        Ok(AccountEquity {
            equity: field_f64(&data, "accountEquity").unwrap_or(0.0),
            available: field_f64(&data, "available").unwrap_or(0.0),
            unrealized_pl: field_f64(&data, "unrealizedPL").unwrap_or(0.0),
        })
    }
}

// ─── Spot adapter ────────────────────────────────────────────────────────────

pub struct SpotAdapter {
    client: Arc<BitgetClient>,
}

impl SpotAdapter {
    pub fn new(client: Arc<BitgetClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OrderService for SpotAdapter {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlacedOrder> {
        // Margin fields and tradeSide are derivatives-only; dropped here.
        let mut body = json!({
            "symbol": req.symbol,
            "side": req.side.as_str(),
            "orderType": req.order_type.as_str(),
            "force": req.force.as_str(),
            "size": req.size,
        });
        if let Some(price) = &req.price {
            body["price"] = json!(price);
        }
        if let Some(oid) = &req.client_oid {
            body["clientOid"] = json!(oid);
        }
        let data = self.client.post_signed("/api/v2/spot/trade/place-order", &body).await?;
        Ok(PlacedOrder {
            order_id: data["orderId"].as_str().unwrap_or_default().to_string(),
            client_oid: data["clientOid"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let body = json!({ "symbol": symbol, "orderId": order_id });
        self.client.post_signed("/api/v2/spot/trade/cancel-order", &body).await?;
        Ok(())
    }

    async fn batch_cancel(&self, symbol: &str, order_ids: &[String]) -> Result<BatchCancelResult> {
        let body = json!({ "symbol": symbol, "orderIds": order_ids });
        match self.client.post_signed("/api/v2/spot/trade/batch-cancel-order", &body).await {
            Ok(data) => Ok(parse_batch_result(&data)),
            Err(e) => {
                // Degrade to per-order cancellation when the batch endpoint
                // is unavailable for this account tier.
                log::warn!("[SPOT] batch cancel failed ({}), falling back to per-order", e);
                let mut out = BatchCancelResult::default();
                for id in order_ids {
                    match self.cancel_order(symbol, id).await {
                        Ok(()) => out.cancelled.push(id.clone()),
                        Err(e) => out.failed.push((id.clone(), e.to_string())),
                    }
                }
                Ok(out)
            }
        }
    }

    async fn pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>> {
        let data = self
            .client
            .get_signed("/api/v2/spot/trade/unfilled-orders", &[("symbol", symbol.to_string())])
            .await?;
        let rows = data.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(parse_pending_row).collect())
    }

    async fn order_detail(&self, _symbol: &str, order_id: &str) -> Result<OrderDetail> {
        let data = self
            .client
            .get_signed("/api/v2/spot/trade/orderInfo", &[("orderId", order_id.to_string())])
            .await?;
        let row = data
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or(data);
        parse_detail(&row)
            .ok_or_else(|| EngineError::Transport(format!("order detail missing state: {}", order_id)))
    }
}

#[async_trait]
impl MarketDataService for SpotAdapter {
    async fn ticker(&self, symbol: &str) -> Result<Ticker> {
        let data = self
            .client
            .get_public("/api/v2/spot/market/tickers", &[("symbol", symbol.to_string())])
            .await?;
        let row = data
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .ok_or_else(|| EngineError::Transport(format!("empty ticker for {}", symbol)))?;
        Ok(parse_ticker_row(&row))
    }

    /// Spot has no depth endpoint cheap enough to poll; bid/ask come off the
    /// ticker row.
    async fn best_bid(&self, symbol: &str) -> Result<f64> {
        self.ticker(symbol)
            .await?
            .bid
            .ok_or_else(|| EngineError::Transport(format!("ticker for {} carries no bid", symbol)))
    }

    async fn best_ask(&self, symbol: &str) -> Result<f64> {
        self.ticker(symbol)
            .await?
            .ask
            .ok_or_else(|| EngineError::Transport(format!("ticker for {} carries no ask", symbol)))
    }
}

#[async_trait]
impl AccountService for SpotAdapter {
    async fn available_balance(&self, _symbol: &str) -> Result<f64> {
        let data = self
            .client
            .get_signed("/api/v2/spot/account/assets", &[("coin", "USDT".to_string())])
            .await?;
        let row = data.as_array().and_then(|a| a.first()).cloned().unwrap_or(Value::Null);
        Ok(field_f64(&row, "available").unwrap_or(0.0))
    }

    /// Spot equity is just the available balance; nothing is unrealized.
    async fn account_equity(&self, symbol: &str) -> Result<AccountEquity> {
        let available = self.available_balance(symbol).await?;
        Ok(AccountEquity { equity: available, available, unrealized_pl: 0.0 })
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Resolves the account's position mode once per start. Defaults to
/// double_hold on any failure — the hedge-mode endpoint rejects orders with
/// a *missing* tradeSide with a specific error, so always sending it is the
/// recoverable direction.
pub async fn detect_hold_mode(
    client: &BitgetClient,
    symbol: &str,
    product_type: &str,
    margin_coin: &str,
) -> HoldMode {
    let result = client
        .get_signed(
            "/api/v2/mix/account/account",
            &[
                ("symbol", symbol.to_string()),
                ("productType", product_type.to_string()),
                ("marginCoin", margin_coin.to_string()),
            ],
        )
        .await;
    match result {
        Ok(data) => match data["posMode"].as_str() {
            Some("single_hold") | Some("one_way_mode") => HoldMode::SingleHold,
            Some("double_hold") | Some("hedge_mode") => HoldMode::DoubleHold,
            other => {
                log::warn!("[SERVICES] unrecognized posMode {:?}, assuming double_hold", other);
                HoldMode::DoubleHold
            }
        },
        Err(e) => {
            log::warn!("[SERVICES] hold-mode detection failed ({}), assuming double_hold", e);
            HoldMode::DoubleHold
        }
    }
}

/// Builds the capability triple for a trading type.
pub async fn build_services(client: Arc<BitgetClient>, base: &BaseConfig) -> TradingServices {
    match base.trading_type {
        VenueKind::Derivatives => {
            let product_type = base
                .product_type
                .clone()
                .unwrap_or_else(|| PRODUCT_TYPE_USDT_FUTURES.to_string());
            let margin_mode = base.margin_mode.clone().unwrap_or_else(|| "crossed".to_string());
            let margin_coin = base.margin_coin.clone().unwrap_or_else(|| "USDT".to_string());
            let hold_mode = match base.position_mode_override {
                Some(mode) => {
                    log::info!("[SERVICES] position mode forced to {:?} by config", mode);
                    mode
                }
                None => detect_hold_mode(&client, &base.symbol, &product_type, &margin_coin).await,
            };
            let adapter = Arc::new(DerivativesAdapter::new(
                client,
                product_type,
                margin_mode,
                margin_coin,
            ));
            TradingServices {
                order: adapter.clone(),
                market: adapter.clone(),
                account: adapter,
                venue: VenueKind::Derivatives,
                hold_mode,
            }
        }
        VenueKind::Spot => {
            let adapter = Arc::new(SpotAdapter::new(client));
            TradingServices {
                order: adapter.clone(),
                market: adapter.clone(),
                account: adapter,
                venue: VenueKind::Spot,
                hold_mode: HoldMode::SingleHold,
            }
        }
    }
}

// ─── In-memory stub exchange for engine tests ────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pending_row() {
        let row = json!({
            "orderId": "123", "clientOid": "abc", "price": "69999.8",
            "size": "0.000143", "cTime": "1754000000000"
        });
        let p = parse_pending_row(&row).unwrap();
        assert_eq!(p.order_id, "123");
        assert_eq!(p.price, 69999.8);
        assert_eq!(p.created_at, 1_754_000_000_000);
    }

    #[test]
    fn test_parse_detail_accepts_state_or_status() {
        let mix = json!({"orderId": "1", "state": "filled", "uTime": "10"});
        let spot = json!({"orderId": "2", "status": "cancelled"});
        assert_eq!(parse_detail(&mix).unwrap().state, "filled");
        assert_eq!(parse_detail(&mix).unwrap().updated_at, Some(10));
        assert_eq!(parse_detail(&spot).unwrap().state, "cancelled");
        assert!(parse_detail(&json!({"orderId": "3"})).is_none());
    }

    #[test]
    fn test_parse_ticker_row() {
        let row = json!({
            "lastPr": "70000.0", "high24h": "71000.0", "low24h": "69000.0",
            "bidPr": "69999.9", "askPr": "70000.1"
        });
        let t = parse_ticker_row(&row);
        assert_eq!(t.last, 70000.0);
        assert_eq!(t.bid, Some(69999.9));
        assert_eq!(t.ask, Some(70000.1));
    }

    #[test]
    fn test_parse_batch_result_partitions() {
        let data = json!({
            "successList": [{"orderId": "1"}, {"orderId": "2"}],
            "failureList": [{"orderId": "3", "errorMsg": "order filled"}]
        });
        let r = parse_batch_result(&data);
        assert_eq!(r.cancelled, vec!["1", "2"]);
        assert_eq!(r.failed.len(), 1);
        assert_eq!(r.failed[0].0, "3");
    }

    #[test]
    fn test_parse_depth_level() {
        let bids = json!([["69999.9", "1.5"], ["69999.8", "2.0"]]);
        assert_eq!(parse_depth_level(&bids), Some(69999.9));
        assert_eq!(parse_depth_level(&json!([])), None);
    }

    #[tokio::test]
    async fn test_stub_place_and_fill_round() {
        use super::stubs::StubExchange;
        let stub = StubExchange::new();
        let req = OrderRequest::limit("BTCUSDT", Side::Buy, "69999.8", "0.000143", TimeInForce::PostOnly);
        let placed = stub.place_order(&req).await.unwrap();
        assert_eq!(stub.pending_orders("BTCUSDT").await.unwrap().len(), 1);

        stub.fill_order(&placed.order_id, 42);
        assert!(stub.pending_orders("BTCUSDT").await.unwrap().is_empty());
        let detail = stub.order_detail("BTCUSDT", &placed.order_id).await.unwrap();
        assert_eq!(detail.state, "filled");
    }
}
