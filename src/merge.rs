// ─────────────────────────────────────────────────────────────────────────────
// merge.rs — pending-sell consolidation
//
// When the pending-sell count saturates, the oldest `merge_threshold` sells
// are collapsed into a single sell at their size-weighted average price.
// The replacement carries no linkedOrderId; the source order ids travel in
// the ORDERS_MERGED event payload instead.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, Result};
use crate::instruments::InstrumentSpec;
use crate::services::{OrderRequest, OrderService, TimeInForce, TradeSide};
use crate::tracker::{OrderStatus, OrderTracker, Side, TrackedOrder, TradeDirection};

const CANCEL_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged_count: usize,
    pub cancelled: Vec<String>,
    pub source_order_ids: Vec<String>,
    pub new_order_id: Option<String>,
    pub avg_price: String,
    pub total_size: String,
}

pub struct MergeEngine {
    in_flight: AtomicBool,
}

struct LatchGuard<'a>(&'a AtomicBool);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MergeEngine {
    pub fn new() -> Self {
        Self { in_flight: AtomicBool::new(false) }
    }

    /// Collapses the oldest `merge_threshold` pending sells. Returns None
    /// when a merge is already in flight or there is nothing to merge.
    pub async fn run(
        &self,
        order_service: &Arc<dyn OrderService>,
        tracker: &Arc<Mutex<OrderTracker>>,
        spec: &InstrumentSpec,
        merge_threshold: usize,
        trade_side: Option<TradeSide>,
        direction: TradeDirection,
    ) -> Result<Option<MergeOutcome>> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            log::debug!("[MERGE] skipped, previous merge still in flight");
            return Ok(None);
        }
        let _latch = LatchGuard(&self.in_flight);

        let targets: Vec<TrackedOrder> = {
            let tracker = tracker.lock().unwrap_or_else(|e| e.into_inner());
            tracker.pending_sells().into_iter().take(merge_threshold).collect()
        };
        if targets.len() < 2 {
            return Ok(None);
        }

        let total_size: f64 = targets.iter().map(|o| o.size_f64()).sum();
        let weighted: f64 = targets.iter().map(|o| o.price_f64() * o.size_f64()).sum();
        if total_size <= 0.0 {
            return Err(EngineError::MergeFailed("merged size is zero".into()));
        }
        let avg_price = spec.format_price(weighted / total_size);
        let size_str = spec.format_size(total_size);
        let ids: Vec<String> = targets.iter().map(|o| o.order_id.clone()).collect();

        log::info!(
            "[MERGE] collapsing {} sells into one at {} x {}",
            targets.len(), avg_price, size_str
        );

        // Cancel in batches of 50, collecting the per-order outcomes.
        let mut cancelled: Vec<String> = Vec::new();
        for chunk in ids.chunks(CANCEL_BATCH_SIZE) {
            let result = order_service.batch_cancel(&spec.symbol, chunk).await?;
            for (id, msg) in &result.failed {
                log::warn!("[MERGE] cancel failed for {}: {}", id, msg);
            }
            cancelled.extend(result.cancelled);
        }

        {
            let mut tracker = tracker.lock().unwrap_or_else(|e| e.into_inner());
            for id in &cancelled {
                tracker.mark_cancelled(id);
            }
        }

        if cancelled.is_empty() {
            return Err(EngineError::MergeFailed(
                "no pending sell could be cancelled".into(),
            ));
        }

        let request = OrderRequest::limit(
            &spec.symbol,
            Side::Sell,
            &avg_price,
            &size_str,
            TimeInForce::PostOnly,
        )
        .with_trade_side(trade_side)
        .with_client_oid(format!("merge-{}", uuid::Uuid::new_v4().simple()));

        let placed = order_service.place_order(&request).await?;
        let now = chrono::Utc::now().timestamp_millis();
        let merged_order = TrackedOrder {
            order_id: placed.order_id.clone(),
            client_oid: request.client_oid.clone().unwrap_or_default(),
            side: Side::Sell,
            price: avg_price.clone(),
            size: size_str.clone(),
            status: OrderStatus::Pending,
            linked_order_id: None,
            direction,
            created_at: now,
            filled_at: None,
        };
        tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(merged_order);

        Ok(Some(MergeOutcome {
            merged_count: cancelled.len(),
            cancelled,
            source_order_ids: ids,
            new_order_id: Some(placed.order_id),
            avg_price,
            total_size: size_str,
        }))
    }
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::{InstrumentSpec, VenueKind};
    use crate::services::stubs::StubExchange;

    fn spec() -> InstrumentSpec {
        InstrumentSpec {
            symbol: "BTCUSDT".into(),
            venue: VenueKind::Derivatives,
            base_coin: "BTC".into(),
            quote_coin: "USDT".into(),
            price_place: 1,
            volume_place: 0,
            min_trade_num: 1.0,
            size_multiplier: 1.0,
            maker_fee_rate: 0.0002,
            taker_fee_rate: 0.0006,
            status: "normal".into(),
        }
    }

    fn sell(id: &str, price: &str, size: &str, created_at: i64) -> TrackedOrder {
        TrackedOrder {
            order_id: id.into(),
            client_oid: format!("c-{}", id),
            side: Side::Sell,
            price: price.into(),
            size: size.into(),
            status: OrderStatus::Pending,
            linked_order_id: None,
            direction: TradeDirection::Long,
            created_at,
            filled_at: None,
        }
    }

    fn tracker_with_three_sells() -> Arc<Mutex<OrderTracker>> {
        let mut t = OrderTracker::new();
        t.insert(sell("s1", "100.1", "1", 10));
        t.insert(sell("s2", "100.3", "2", 20));
        t.insert(sell("s3", "100.5", "3", 30));
        Arc::new(Mutex::new(t))
    }

    #[tokio::test]
    async fn test_weighted_average_merge() {
        let stub = StubExchange::new();
        let tracker = tracker_with_three_sells();
        let engine = MergeEngine::new();

        let order: Arc<dyn OrderService> = stub.clone();
        let outcome = engine
            .run(&order, &tracker, &spec(), 2, Some(TradeSide::Close), TradeDirection::Long)
            .await
            .unwrap()
            .unwrap();

        // Oldest two: (100.1 x 1) and (100.3 x 2) → avg 300.7 / 3 = 100.2333…
        assert_eq!(outcome.merged_count, 2);
        assert_eq!(outcome.avg_price, "100.2");
        assert_eq!(outcome.total_size, "3");
        assert_eq!(outcome.source_order_ids, vec!["s1", "s2"]);
        assert!(outcome.new_order_id.is_some());

        let placed = stub.last_placed().unwrap();
        assert_eq!(placed.price.as_deref(), Some("100.2"));
        assert_eq!(placed.force, TimeInForce::PostOnly);
        assert_eq!(placed.trade_side, Some(TradeSide::Close));

        // Pending count: 3 - 2 cancelled + 1 new = 2.
        let t = tracker.lock().unwrap();
        assert_eq!(t.pending_sell_count(), 2);
        assert!(t.get(outcome.new_order_id.as_deref().unwrap()).unwrap().linked_order_id.is_none());
    }

    #[tokio::test]
    async fn test_partial_cancel_still_places() {
        let stub = StubExchange::new();
        stub.batch_fail_ids.lock().unwrap().insert("s1".into());
        let tracker = tracker_with_three_sells();
        let engine = MergeEngine::new();

        let order: Arc<dyn OrderService> = stub.clone();
        let outcome = engine
            .run(&order, &tracker, &spec(), 2, None, TradeDirection::Long)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.merged_count, 1);
        assert_eq!(outcome.cancelled, vec!["s2"]);
        // s1 survived the cancel; s2 merged away; the replacement is pending.
        let t = tracker.lock().unwrap();
        assert_eq!(t.pending_sell_count(), 3); // s1 + s3 + merged
        assert_eq!(t.get("s1").unwrap().status, OrderStatus::Pending);
        assert_eq!(t.get("s2").unwrap().status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_no_cancellation_fails_merge() {
        let stub = StubExchange::new();
        {
            let mut fail = stub.batch_fail_ids.lock().unwrap();
            fail.insert("s1".into());
            fail.insert("s2".into());
        }
        let tracker = tracker_with_three_sells();
        let engine = MergeEngine::new();

        let order: Arc<dyn OrderService> = stub.clone();
        let err = engine
            .run(&order, &tracker, &spec(), 2, None, TradeDirection::Long)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MergeFailed(_)));
        assert_eq!(stub.placed_count(), 0);
        assert_eq!(tracker.lock().unwrap().pending_sell_count(), 3);
    }

    #[tokio::test]
    async fn test_fewer_than_two_sells_is_a_noop() {
        let stub = StubExchange::new();
        let mut t = OrderTracker::new();
        t.insert(sell("s1", "100.1", "1", 10));
        let tracker = Arc::new(Mutex::new(t));
        let engine = MergeEngine::new();

        let order: Arc<dyn OrderService> = stub.clone();
        let outcome = engine
            .run(&order, &tracker, &spec(), 5, None, TradeDirection::Long)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(stub.placed_count(), 0);
    }

    #[tokio::test]
    async fn test_latch_blocks_reentry() {
        let engine = MergeEngine::new();
        engine.in_flight.store(true, Ordering::SeqCst);

        let stub = StubExchange::new();
        let tracker = tracker_with_three_sells();
        let order: Arc<dyn OrderService> = stub.clone();
        let outcome = engine
            .run(&order, &tracker, &spec(), 2, None, TradeDirection::Long)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
