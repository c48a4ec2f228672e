//! Condition-pooled fold, kept only as a diagnostic.
//!
//! Pooling every outcome of a condition into one inventory lets a redemption of the winning
//! outcome consume cost basis bought under a losing outcome. The result overstates realized
//! P&L whenever a wallet holds both sides. Production folds never use this.

use crate::domain::{
    Address, ConditionId, Decimal, SettlementEvent, SettlementKind, Side, TradeEvent,
};

use super::ledger::PositionLedger;
use super::{LegAction, LegEvent, PartitionKey};

/// Realized P&L of `wallet` on `condition_id` with all outcomes sharing one cost basis.
pub fn pooled_realized_pnl(
    wallet: &Address,
    condition_id: &ConditionId,
    outcome_count: u32,
    trades: &[TradeEvent],
    settlements: &[SettlementEvent],
) -> Decimal {
    let sets = Decimal::from_u64(outcome_count.max(1) as u64);
    let mut legs: Vec<LegEvent> = Vec::new();

    for trade in trades
        .iter()
        .filter(|t| &t.wallet == wallet && t.condition_id.as_ref() == Some(condition_id))
    {
        let action = match trade.side {
            Side::Buy => LegAction::Buy {
                shares: trade.shares,
                price: trade.price,
                fee: trade.fee,
            },
            Side::Sell => LegAction::Sell {
                shares: trade.shares,
                price: trade.price,
                fee: trade.fee,
            },
        };
        legs.push(LegEvent {
            key: trade.key.clone(),
            time_ms: trade.time_ms,
            action,
        });
    }

    for event in settlements
        .iter()
        .filter(|s| &s.wallet == wallet && &s.condition_id == condition_id)
    {
        let action = match event.kind {
            SettlementKind::Split => LegAction::Split {
                shares: event.shares * sets,
                cost: event.usdc_delta.abs(),
            },
            SettlementKind::Merge => LegAction::Merge {
                shares: event.shares * sets,
                proceeds: event.usdc_delta,
            },
            SettlementKind::Redeem => LegAction::Redeem {
                shares: event.shares,
                observed_usdc: event.usdc_delta,
            },
        };
        legs.push(LegEvent {
            key: event.key.clone(),
            time_ms: event.time_ms,
            action,
        });
    }

    legs.sort_by_cached_key(LegEvent::ordering_key);

    let mut ledger = PositionLedger::new(PartitionKey::new(wallet.clone(), condition_id.clone(), 0));
    for leg in &legs {
        ledger.apply(leg);
    }
    ledger.position().realized_pnl
}
