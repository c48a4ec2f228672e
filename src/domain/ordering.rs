//! Stable event ordering for deterministic folds.

use crate::domain::{EventKey, SettlementEvent, TimeMs, TradeEvent, TxHash};
use serde::{Deserialize, Serialize};

/// Stable ordering key for ledger events.
///
/// Ordering: time_ms -> tx_hash -> log_index. Events sharing a timestamp therefore fold in
/// the same order no matter how the input batch was arranged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventOrderingKey {
    pub time_ms: TimeMs,
    pub tx_hash: TxHash,
    pub log_index: i64,
}

impl EventOrderingKey {
    pub fn new(time_ms: TimeMs, key: &EventKey) -> Self {
        Self {
            time_ms,
            tx_hash: key.tx_hash.clone(),
            log_index: key.log_index,
        }
    }

    pub fn from_trade(trade: &TradeEvent) -> Self {
        Self::new(trade.time_ms, &trade.key)
    }

    pub fn from_settlement(event: &SettlementEvent) -> Self {
        Self::new(event.time_ms, &event.key)
    }

    pub fn event_key(&self) -> EventKey {
        EventKey::new(self.tx_hash.clone(), self.log_index)
    }
}

pub fn sort_trades_deterministic(trades: &mut [TradeEvent]) {
    trades.sort_by_cached_key(EventOrderingKey::from_trade);
}

pub fn sort_settlements_deterministic(events: &mut [SettlementEvent]) {
    events.sort_by_cached_key(EventOrderingKey::from_settlement);
}
