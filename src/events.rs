use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of events an engine can emit. The ring keeps the most recent
/// 1000 and the tail is what the status surface renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    StrategyStarted,
    StrategyStopped,
    StrategyError,
    BuyOrderPlaced,
    BuyOrderCancelled,
    BuyOrderFilled,
    SellOrderPlaced,
    SellOrderFilled,
    SellOrderFailed,
    OrdersMerged,
    RiskLimitHit,
    ConfigUpdated,
    EmergencyStop,
    GridBuyFilled,
    GridSellFilled,
    GridLevelUpdated,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyEvent {
    pub kind: EventKind,
    /// Epoch milliseconds at emission.
    pub ts: i64,
    pub data: Value,
}

pub const EVENT_RING_CAPACITY: usize = 1000;

/// Bounded event log, newest-wins.
pub struct EventLog {
    ring: VecDeque<StrategyEvent>,
    capacity: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { ring: VecDeque::with_capacity(capacity.min(64)), capacity }
    }

    pub fn emit(&mut self, kind: EventKind, data: Value) {
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(StrategyEvent {
            kind,
            ts: chrono::Utc::now().timestamp_millis(),
            data,
        });
    }

    /// The newest `limit` events, oldest-first within the returned slice.
    pub fn tail(&self, limit: usize) -> Vec<StrategyEvent> {
        let skip = self.ring.len().saturating_sub(limit);
        self.ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ring_is_bounded() {
        let mut log = EventLog::with_capacity(5);
        for i in 0..12 {
            log.emit(EventKind::BuyOrderPlaced, json!({"i": i}));
        }
        assert_eq!(log.len(), 5);
        // Oldest surviving entry is i=7.
        assert_eq!(log.tail(100)[0].data["i"], 7);
    }

    #[test]
    fn test_tail_returns_newest() {
        let mut log = EventLog::new();
        for i in 0..10 {
            log.emit(EventKind::SellOrderFilled, json!({"i": i}));
        }
        let tail = log.tail(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].data["i"], 7);
        assert_eq!(tail[2].data["i"], 9);
    }

    #[test]
    fn test_tail_larger_than_log() {
        let mut log = EventLog::new();
        log.emit(EventKind::StrategyStarted, json!({}));
        assert_eq!(log.tail(50).len(), 1);
    }

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventKind::BuyOrderFilled).unwrap(),
            "\"BUY_ORDER_FILLED\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::GridLevelUpdated).unwrap(),
            "\"GRID_LEVEL_UPDATED\""
        );
    }
}
