// ─────────────────────────────────────────────────────────────────────────────
// tracker.rs — local order book-keeping and the reconciliation two-step
//
// "Not in the exchange's pending list" alone cannot distinguish a fill from
// a cancellation, so the reconciler works in two steps: find_disappeared()
// over a pre-fetch snapshot of local pending ids, then a detail lookup per
// disappeared order whose returned state drives the transition. A failed
// detail lookup leaves the order pending — absence is never a fill.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Long,
    Short,
    Both,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Long => "long",
            TradeDirection::Short => "short",
            TradeDirection::Both => "both",
        }
    }
}

/// One order as the engine believes it to be. Prices and sizes are kept as
/// the exact strings sent to the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub order_id: String,
    pub client_oid: String,
    pub side: Side,
    pub price: String,
    pub size: String,
    pub status: OrderStatus,
    pub linked_order_id: Option<String>,
    pub direction: TradeDirection,
    pub created_at: i64,
    pub filled_at: Option<i64>,
}

impl TrackedOrder {
    pub fn price_f64(&self) -> f64 {
        self.price.parse().unwrap_or(0.0)
    }

    pub fn size_f64(&self) -> f64 {
        self.size.parse().unwrap_or(0.0)
    }

    pub fn notional(&self) -> f64 {
        self.price_f64() * self.size_f64()
    }
}

/// The `state` field returned by the order-detail endpoint, collapsed to the
/// four cases the reconciler distinguishes. Anything unrecognized is treated
/// as terminal-not-filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOrderState {
    Live,
    PartiallyFilled,
    Filled,
    Cancelled,
}

pub fn map_exchange_state(raw: &str) -> ExchangeOrderState {
    match raw {
        "live" | "new" => ExchangeOrderState::Live,
        "partially_filled" => ExchangeOrderState::PartiallyFilled,
        "filled" => ExchangeOrderState::Filled,
        _ => ExchangeOrderState::Cancelled, // "cancelled", "canceled", anything terminal
    }
}

const MAX_NON_PENDING: usize = 500;

/// Order store shared by both loops. At most one outstanding buy (scalping);
/// pending orders are never evicted by cleanup.
#[derive(Default)]
pub struct OrderTracker {
    orders: HashMap<String, TrackedOrder>,
    active_buy_order_id: Option<String>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, order: TrackedOrder) {
        if order.side == Side::Buy && order.status == OrderStatus::Pending {
            self.active_buy_order_id = Some(order.order_id.clone());
        }
        self.orders.insert(order.order_id.clone(), order);
    }

    pub fn get(&self, order_id: &str) -> Option<&TrackedOrder> {
        self.orders.get(order_id)
    }

    /// Terminal statuses never regress; repeated marks are no-ops.
    pub fn mark_filled(&mut self, order_id: &str, filled_at: i64) -> bool {
        let Some(order) = self.orders.get_mut(order_id) else { return false };
        if order.status.is_terminal() {
            return false;
        }
        order.status = OrderStatus::Filled;
        order.filled_at = Some(filled_at);
        self.clear_active_buy_if(order_id);
        true
    }

    pub fn mark_cancelled(&mut self, order_id: &str) -> bool {
        let Some(order) = self.orders.get_mut(order_id) else { return false };
        if order.status.is_terminal() {
            return false;
        }
        order.status = OrderStatus::Cancelled;
        self.clear_active_buy_if(order_id);
        true
    }

    pub fn mark_failed(&mut self, order_id: &str) -> bool {
        let Some(order) = self.orders.get_mut(order_id) else { return false };
        if order.status.is_terminal() {
            return false;
        }
        order.status = OrderStatus::Failed;
        self.clear_active_buy_if(order_id);
        true
    }

    /// Pairs a buy with its sell. Write-once: an existing linkage is kept.
    pub fn link(&mut self, buy_order_id: &str, sell_order_id: &str) -> bool {
        let Some(buy) = self.orders.get_mut(buy_order_id) else { return false };
        if buy.linked_order_id.is_some() {
            return false;
        }
        buy.linked_order_id = Some(sell_order_id.to_string());
        true
    }

    fn clear_active_buy_if(&mut self, order_id: &str) {
        if self.active_buy_order_id.as_deref() == Some(order_id) {
            self.active_buy_order_id = None;
        }
    }

    pub fn active_buy(&self) -> Option<TrackedOrder> {
        self.active_buy_order_id
            .as_deref()
            .and_then(|id| self.orders.get(id))
            .filter(|o| o.status == OrderStatus::Pending)
            .cloned()
    }

    /// Pending sells, oldest first — the merge engine consumes from the front.
    pub fn pending_sells(&self) -> Vec<TrackedOrder> {
        let mut sells: Vec<TrackedOrder> = self
            .orders
            .values()
            .filter(|o| o.side == Side::Sell && o.status == OrderStatus::Pending)
            .cloned()
            .collect();
        sells.sort_by_key(|o| o.created_at);
        sells
    }

    pub fn pending_sell_count(&self) -> usize {
        self.orders
            .values()
            .filter(|o| o.side == Side::Sell && o.status == OrderStatus::Pending)
            .count()
    }

    /// Current position exposure: the notional held behind pending sells.
    pub fn position_notional(&self) -> f64 {
        self.orders
            .values()
            .filter(|o| o.side == Side::Sell && o.status == OrderStatus::Pending)
            .map(|o| o.notional())
            .sum()
    }

    /// Snapshot of local pending ids. Taken *before* the exchange fetch so
    /// that orders placed mid-reconcile are not treated as disappeared.
    pub fn pending_ids(&self) -> Vec<String> {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .map(|o| o.order_id.clone())
            .collect()
    }

    /// Orders from `snapshot` that are still locally pending but absent from
    /// the exchange's pending set.
    pub fn find_disappeared(
        &self,
        snapshot: &[String],
        exchange_pending: &HashSet<String>,
    ) -> Vec<TrackedOrder> {
        snapshot
            .iter()
            .filter(|id| !exchange_pending.contains(*id))
            .filter_map(|id| self.orders.get(id))
            .filter(|o| o.status == OrderStatus::Pending)
            .cloned()
            .collect()
    }

    /// Bounds memory: keeps the newest 500 non-pending orders, all pending.
    pub fn cleanup(&mut self) {
        let mut done: Vec<(i64, String)> = self
            .orders
            .values()
            .filter(|o| o.status.is_terminal())
            .map(|o| (o.created_at, o.order_id.clone()))
            .collect();
        if done.len() <= MAX_NON_PENDING {
            return;
        }
        done.sort_by_key(|(ts, _)| *ts);
        let excess = done.len() - MAX_NON_PENDING;
        for (_, id) in done.into_iter().take(excess) {
            self.orders.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: &str, side: Side, price: &str, size: &str, created_at: i64) -> TrackedOrder {
        TrackedOrder {
            order_id: id.to_string(),
            client_oid: format!("c-{}", id),
            side,
            price: price.to_string(),
            size: size.to_string(),
            status: OrderStatus::Pending,
            linked_order_id: None,
            direction: TradeDirection::Long,
            created_at,
            filled_at: None,
        }
    }

    #[test]
    fn test_active_buy_slot() {
        let mut t = OrderTracker::new();
        t.insert(order("b1", Side::Buy, "100.0", "1", 1));
        assert_eq!(t.active_buy().unwrap().order_id, "b1");

        t.mark_filled("b1", 10);
        assert!(t.active_buy().is_none());
    }

    #[test]
    fn test_terminal_status_never_regresses() {
        let mut t = OrderTracker::new();
        t.insert(order("s1", Side::Sell, "101.0", "1", 1));
        assert!(t.mark_cancelled("s1"));
        assert!(!t.mark_filled("s1", 10));
        assert_eq!(t.get("s1").unwrap().status, OrderStatus::Cancelled);
        assert!(t.get("s1").unwrap().filled_at.is_none());
    }

    #[test]
    fn test_link_is_write_once() {
        let mut t = OrderTracker::new();
        t.insert(order("b1", Side::Buy, "100.0", "1", 1));
        assert!(t.link("b1", "s1"));
        assert!(!t.link("b1", "s2"));
        assert_eq!(t.get("b1").unwrap().linked_order_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_pending_sells_sorted_oldest_first() {
        let mut t = OrderTracker::new();
        t.insert(order("s2", Side::Sell, "100.3", "2", 20));
        t.insert(order("s1", Side::Sell, "100.1", "1", 10));
        t.insert(order("s3", Side::Sell, "100.5", "3", 30));
        let sells = t.pending_sells();
        assert_eq!(
            sells.iter().map(|o| o.order_id.as_str()).collect::<Vec<_>>(),
            vec!["s1", "s2", "s3"]
        );
    }

    #[test]
    fn test_position_notional_sums_pending_sells_only() {
        let mut t = OrderTracker::new();
        t.insert(order("s1", Side::Sell, "100.0", "2", 1));
        t.insert(order("b1", Side::Buy, "99.0", "5", 2));
        t.insert(order("s2", Side::Sell, "50.0", "1", 3));
        t.mark_cancelled("s2");
        assert!((t.position_notional() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_find_disappeared_respects_snapshot() {
        let mut t = OrderTracker::new();
        t.insert(order("s1", Side::Sell, "100.0", "1", 1));
        let snapshot = t.pending_ids();

        // Order placed after the snapshot must not be reported even though
        // the exchange set does not contain it.
        t.insert(order("s2", Side::Sell, "101.0", "1", 2));

        let exchange: HashSet<String> = HashSet::new();
        let gone = t.find_disappeared(&snapshot, &exchange);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].order_id, "s1");
    }

    #[test]
    fn test_find_disappeared_skips_present_orders() {
        let mut t = OrderTracker::new();
        t.insert(order("s1", Side::Sell, "100.0", "1", 1));
        t.insert(order("s2", Side::Sell, "101.0", "1", 2));
        let snapshot = t.pending_ids();
        let exchange: HashSet<String> = ["s1".to_string()].into_iter().collect();
        let gone = t.find_disappeared(&snapshot, &exchange);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].order_id, "s2");
    }

    #[test]
    fn test_cleanup_keeps_pending_and_bounds_terminal() {
        let mut t = OrderTracker::new();
        for i in 0..600 {
            let id = format!("s{}", i);
            t.insert(order(&id, Side::Sell, "100.0", "1", i));
            t.mark_filled(&id, i + 1);
        }
        t.insert(order("keep", Side::Sell, "100.0", "1", 9999));
        t.cleanup();
        assert_eq!(t.len(), 501); // 500 terminal + 1 pending
        assert!(t.get("keep").is_some());
        // Oldest terminal entries were evicted.
        assert!(t.get("s0").is_none());
        assert!(t.get("s599").is_some());
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_exchange_state("live"), ExchangeOrderState::Live);
        assert_eq!(map_exchange_state("new"), ExchangeOrderState::Live);
        assert_eq!(map_exchange_state("partially_filled"), ExchangeOrderState::PartiallyFilled);
        assert_eq!(map_exchange_state("filled"), ExchangeOrderState::Filled);
        assert_eq!(map_exchange_state("cancelled"), ExchangeOrderState::Cancelled);
        assert_eq!(map_exchange_state("canceled"), ExchangeOrderState::Cancelled);
        assert_eq!(map_exchange_state("rejected"), ExchangeOrderState::Cancelled);
    }
}
