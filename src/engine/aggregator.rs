//! Wallet- and market-level P&L rollups with coverage.

use crate::domain::{
    Address, ConditionId, Coverage, Decimal, MarketPnL, PnlWindow, SettlementPolicy, WalletPnL,
};
use std::collections::BTreeSet;

use super::settlement::SettledPosition;
use super::Effect;

pub struct WalletAggregateInput<'a> {
    pub wallet: &'a Address,
    pub window: PnlWindow,
    pub policy: SettlementPolicy,
    /// The wallet's mapped positions, settled under `policy`.
    pub settled: &'a [SettledPosition],
    /// The wallet's applied effects.
    pub effects: &'a [Effect],
    /// Distinct (wallet, token) positions with no production mapping.
    pub unmapped_positions: usize,
    pub coverage_floor_pct: Decimal,
    pub mapping_version: i64,
}

/// Roll up one wallet.
///
/// Unbounded windows report position totals. Bounded windows sum realized effect deltas
/// (cash deltas under `CashFlowOnly`) inside the window plus loser write-offs whose resolution
/// falls inside it. Unrealized figures are always point-in-time.
pub fn aggregate_wallet(input: WalletAggregateInput<'_>) -> WalletPnL {
    let realized_pnl = if input.window.is_unbounded() {
        input.settled.iter().map(|s| s.realized_pnl).sum()
    } else if input.policy == SettlementPolicy::CashFlowOnly {
        input
            .effects
            .iter()
            .filter(|e| input.window.contains(e.time_ms))
            .map(|e| e.cash_delta)
            .sum()
    } else {
        let from_effects: Decimal = input
            .effects
            .iter()
            .filter(|e| input.window.contains(e.time_ms))
            .map(|e| e.realized_delta)
            .sum();
        let write_offs: Decimal = input
            .settled
            .iter()
            .filter(|s| {
                s.resolved_at
                    .map(|at| input.window.contains(at))
                    .unwrap_or(false)
            })
            .map(|s| s.write_off)
            .sum();
        from_effects + write_offs
    };

    let unrealized_pnl = input.settled.iter().map(|s| s.unrealized_pnl).sum();
    let unrealized_winner_value = input
        .settled
        .iter()
        .map(|s| s.unrealized_winner_value)
        .sum();

    let resolved_count = input.settled.iter().filter(|s| s.is_resolved()).count();
    let total_count = input.settled.len() + input.unmapped_positions;
    let coverage = Coverage::compute(resolved_count, total_count, input.coverage_floor_pct);

    WalletPnL::new(
        input.wallet.clone(),
        input.window,
        input.policy,
        realized_pnl,
        unrealized_pnl,
        unrealized_winner_value,
        coverage,
        input.mapping_version,
    )
}

/// Roll up one condition across every wallet holding it.
pub fn aggregate_market(
    condition_id: &ConditionId,
    policy: SettlementPolicy,
    settled: &[SettledPosition],
) -> MarketPnL {
    let rows: Vec<&SettledPosition> = settled
        .iter()
        .filter(|s| s.position.condition_id() == condition_id)
        .collect();
    let wallets: BTreeSet<&Address> = rows.iter().map(|s| &s.position.key.wallet).collect();
    let realized_pnl: Decimal = rows.iter().map(|s| s.realized_pnl).sum();
    let unrealized_pnl: Decimal = rows.iter().map(|s| s.unrealized_pnl).sum();

    MarketPnL {
        condition_id: condition_id.clone(),
        policy,
        resolved: rows.iter().any(|s| s.is_resolved()),
        wallet_count: wallets.len(),
        position_count: rows.len(),
        realized_pnl,
        unrealized_pnl,
        total_pnl: realized_pnl + unrealized_pnl,
        unrealized_winner_value: rows.iter().map(|s| s.unrealized_winner_value).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKey, MarketResolution, TimeMs, TxHash};
    use crate::engine::settlement::settle_position;
    use crate::engine::{EffectKind, PartitionKey, Position};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn position(wallet: &str, outcome: u32, quantity: &str, realized: &str) -> Position {
        let mut p = Position::new(PartitionKey::new(
            Address::new(wallet),
            ConditionId::new("0xc"),
            outcome,
        ));
        p.quantity = d(quantity);
        p.cost_basis = d("0.5");
        p.realized_pnl = d(realized);
        p
    }

    fn effect(time: i64, realized: &str) -> Effect {
        Effect {
            event_key: EventKey::new(TxHash::new("0x1"), time),
            partition: PartitionKey::new(Address::new("0xa"), ConditionId::new("0xc"), 0),
            kind: EffectKind::Sell,
            qty: d("1"),
            cash_delta: d("1"),
            realized_delta: d(realized),
            time_ms: TimeMs::new(time),
        }
    }

    #[test]
    fn test_windowed_realized_sums_effects_and_write_offs() {
        let resolution = MarketResolution::binary(ConditionId::new("0xc"), 0, TimeMs::new(50));
        let (winner, _) = settle_position(
            &position("0xa", 0, "0", "7"),
            Some(&resolution),
            SettlementPolicy::Asymmetric,
        );
        let (loser, _) = settle_position(
            &position("0xa", 1, "10", "0"),
            Some(&resolution),
            SettlementPolicy::Asymmetric,
        );
        let settled = vec![winner, loser];
        let effects = vec![effect(10, "3"), effect(60, "4")];
        let wallet = Address::new("0xa");

        let windowed = aggregate_wallet(WalletAggregateInput {
            wallet: &wallet,
            window: PnlWindow::between(Some(TimeMs::new(0)), Some(TimeMs::new(55))),
            policy: SettlementPolicy::Asymmetric,
            settled: &settled,
            effects: &effects,
            unmapped_positions: 0,
            coverage_floor_pct: d("2"),
            mapping_version: 1,
        });
        assert_eq!(windowed.realized_pnl, d("-2"));

        let all_time = aggregate_wallet(WalletAggregateInput {
            wallet: &wallet,
            window: PnlWindow::all_time(),
            policy: SettlementPolicy::Asymmetric,
            settled: &settled,
            effects: &effects,
            unmapped_positions: 0,
            coverage_floor_pct: d("2"),
            mapping_version: 1,
        });
        assert_eq!(all_time.realized_pnl, d("2"));
        assert_eq!(all_time.coverage.resolved_count, 2);
        assert_eq!(all_time.coverage_pct(), d("100"));
    }

    #[test]
    fn test_unmapped_positions_lower_coverage() {
        let (open, _) = settle_position(&position("0xa", 0, "10", "0"), None, SettlementPolicy::Asymmetric);
        let wallet = Address::new("0xa");
        let pnl = aggregate_wallet(WalletAggregateInput {
            wallet: &wallet,
            window: PnlWindow::all_time(),
            policy: SettlementPolicy::Asymmetric,
            settled: &[open],
            effects: &[],
            unmapped_positions: 3,
            coverage_floor_pct: d("2"),
            mapping_version: 1,
        });
        assert_eq!(pnl.coverage.total_count, 4);
        assert_eq!(pnl.coverage.resolved_count, 0);
        assert!(pnl.insufficient_coverage());
    }

    #[test]
    fn test_market_rollup_counts_wallets() {
        let resolution = MarketResolution::binary(ConditionId::new("0xc"), 0, TimeMs::new(50));
        let settled: Vec<SettledPosition> = [
            position("0xa", 0, "0", "5"),
            position("0xb", 1, "10", "0"),
            position("0xb", 0, "0", "1"),
        ]
        .iter()
        .map(|p| settle_position(p, Some(&resolution), SettlementPolicy::Symmetric).0)
        .collect();

        let market = aggregate_market(&ConditionId::new("0xc"), SettlementPolicy::Symmetric, &settled);
        assert!(market.resolved);
        assert_eq!(market.wallet_count, 2);
        assert_eq!(market.position_count, 3);
        assert_eq!(market.realized_pnl, d("1"));
    }
}
