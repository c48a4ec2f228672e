//! Resolution-aware settlement of folded positions under a selectable policy.

use crate::domain::{
    ConditionId, Decimal, ErrorLog, LedgerError, LedgerErrorKind, MarketResolution,
    SettlementPolicy, TimeMs,
};
use serde::Serialize;
use std::collections::HashMap;

use super::ledger::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Market has not resolved and shares are still held.
    Open,
    /// Market has not resolved and no shares are held.
    Closed,
    /// Resolved; this outcome pays out.
    Won,
    /// Resolved; this outcome pays nothing.
    Lost,
}

/// A position priced under one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettledPosition {
    #[serde(flatten)]
    pub position: Position,
    pub status: PositionStatus,
    pub payout_price: Option<Decimal>,
    pub resolved_at: Option<TimeMs>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_winner_value: Decimal,
    /// Loss booked at resolution on shares of a losing outcome still held.
    pub write_off: Decimal,
}

impl SettledPosition {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }
}

/// Price one position. Returns a `ResolutionMissing` entry for open positions on an
/// unresolved market.
pub fn settle_position(
    position: &Position,
    resolution: Option<&MarketResolution>,
    policy: SettlementPolicy,
) -> (SettledPosition, Option<LedgerError>) {
    let mut settled = SettledPosition {
        position: position.clone(),
        status: PositionStatus::Closed,
        payout_price: None,
        resolved_at: None,
        realized_pnl: position.realized_pnl,
        unrealized_pnl: Decimal::zero(),
        unrealized_winner_value: Decimal::zero(),
        write_off: Decimal::zero(),
    };
    let mut missing = None;

    match resolution {
        Some(resolution) => {
            let price = resolution
                .payout_price(position.outcome_index())
                .unwrap_or_else(Decimal::zero);
            settled.payout_price = Some(price);
            settled.resolved_at = Some(resolution.resolved_at);
            settled.status = if price.is_positive() {
                PositionStatus::Won
            } else {
                PositionStatus::Lost
            };

            if position.is_open() {
                if price.is_zero() {
                    settled.write_off = -position.open_cost();
                    settled.realized_pnl += settled.write_off;
                } else {
                    let value = price * position.quantity;
                    match policy {
                        SettlementPolicy::Asymmetric => settled.unrealized_winner_value = value,
                        SettlementPolicy::Symmetric => {
                            settled.unrealized_pnl = value - position.open_cost()
                        }
                        SettlementPolicy::CashFlowOnly => {}
                    }
                }
            }
        }
        None => {
            if position.is_open() {
                settled.status = PositionStatus::Open;
                let mark = position.last_price.unwrap_or(position.cost_basis);
                settled.unrealized_pnl = (mark - position.cost_basis) * position.quantity;
                missing = Some(
                    LedgerError::new(
                        LedgerErrorKind::ResolutionMissing,
                        format!(
                            "{} shares open on an unresolved market, marked at {}",
                            position.quantity, mark
                        ),
                    )
                    .with_wallet(&position.key.wallet)
                    .with_condition(&position.key.condition_id)
                    .with_outcome(position.outcome_index()),
                );
            }
        }
    }

    if policy == SettlementPolicy::CashFlowOnly {
        settled.realized_pnl = position.cash_flow;
        settled.unrealized_pnl = Decimal::zero();
        settled.unrealized_winner_value = Decimal::zero();
        settled.write_off = Decimal::zero();
    }

    (settled, missing)
}

/// Price every position against the known resolutions.
pub fn settle_all<'a>(
    positions: impl IntoIterator<Item = &'a Position>,
    resolutions: &HashMap<ConditionId, MarketResolution>,
    policy: SettlementPolicy,
) -> (Vec<SettledPosition>, ErrorLog) {
    let mut errors = ErrorLog::new();
    let settled = positions
        .into_iter()
        .map(|position| {
            let (settled, missing) =
                settle_position(position, resolutions.get(position.condition_id()), policy);
            if let Some(error) = missing {
                errors.record(error);
            }
            settled
        })
        .collect();
    (settled, errors)
}
