//! Per-outcome inventory ledger.
//!
//! A `PositionLedger` folds the legs of exactly one partition in ordering-key order. Cost basis
//! never crosses outcome boundaries: a redemption can only consume inventory that was bought,
//! split or otherwise acquired under the same outcome index.

use crate::domain::{
    ConditionId, Decimal, ErrorLog, EventKey, EventOrderingKey, LedgerError, LedgerErrorKind,
    MarketResolution, OutcomeIndex, TimeMs,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use super::{Effect, LegAction, LegEvent, PartitionKey};

/// Inventory state for one (wallet, condition, outcome).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    #[serde(flatten)]
    pub key: PartitionKey,
    /// Shares held. Never negative.
    pub quantity: Decimal,
    /// Average cost per share, fees capitalized.
    pub cost_basis: Decimal,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    /// Net USDC in minus USDC out over the position's life.
    pub cash_flow: Decimal,
    pub last_price: Option<Decimal>,
    /// Redeemed shares that had no inventory under this outcome. Never credited.
    pub unbacked_redeem_shares: Decimal,
    pub opened_at: Option<TimeMs>,
    pub updated_at: Option<TimeMs>,
}

impl Position {
    pub fn new(key: PartitionKey) -> Self {
        Self {
            key,
            quantity: Decimal::zero(),
            cost_basis: Decimal::zero(),
            realized_pnl: Decimal::zero(),
            fees_paid: Decimal::zero(),
            cash_flow: Decimal::zero(),
            last_price: None,
            unbacked_redeem_shares: Decimal::zero(),
            opened_at: None,
            updated_at: None,
        }
    }

    pub fn condition_id(&self) -> &ConditionId {
        &self.key.condition_id
    }

    pub fn outcome_index(&self) -> OutcomeIndex {
        self.key.outcome_index
    }

    pub fn is_open(&self) -> bool {
        self.quantity.is_positive()
    }

    /// Remaining cost of the shares still held.
    pub fn open_cost(&self) -> Decimal {
        self.cost_basis * self.quantity
    }
}

/// What the ledger did with a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// At or before the resume watermark.
    SkippedWatermark,
    /// Event key already applied to this partition.
    SkippedDuplicate,
}

/// A REDEEM that found no inventory under its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbackedRedeem {
    pub partition: PartitionKey,
    pub event_key: EventKey,
    pub shares: Decimal,
    pub observed_usdc: Decimal,
}

/// Everything a single partition fold produced.
#[derive(Debug, Clone)]
pub struct FoldOutput {
    pub position: Position,
    pub effects: Vec<Effect>,
    pub errors: ErrorLog,
    pub unbacked: Vec<UnbackedRedeem>,
    /// Last applied ordering key (or the resume watermark when nothing new was applied).
    pub watermark: Option<EventOrderingKey>,
    pub applied: usize,
    pub skipped: usize,
}

pub struct PositionLedger {
    position: Position,
    resolution: Option<MarketResolution>,
    watermark: Option<EventOrderingKey>,
    applied_keys: HashSet<EventKey>,

    // Outputs accumulated during processing.
    effects: Vec<Effect>,
    errors: ErrorLog,
    unbacked: Vec<UnbackedRedeem>,
    applied: usize,
    skipped: usize,
}

impl PositionLedger {
    pub fn new(key: PartitionKey) -> Self {
        Self::resume(Position::new(key), None, HashSet::new())
    }

    /// Continue folding a persisted position after `watermark`.
    ///
    /// `applied_keys` holds the event keys already folded into `position`; they are skipped
    /// even when they sort after the watermark.
    pub fn resume(
        position: Position,
        watermark: Option<EventOrderingKey>,
        applied_keys: HashSet<EventKey>,
    ) -> Self {
        Self {
            position,
            resolution: None,
            watermark,
            applied_keys,
            effects: Vec::new(),
            errors: ErrorLog::new(),
            unbacked: Vec::new(),
            applied: 0,
            skipped: 0,
        }
    }

    /// Resolution used to price redemptions. Without one, the observed payout is used.
    pub fn with_resolution(mut self, resolution: Option<MarketResolution>) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    /// Apply one leg. Callers feed legs sorted by ordering key.
    pub fn apply(&mut self, leg: &LegEvent) -> ApplyOutcome {
        let ordering = leg.ordering_key();
        if let Some(watermark) = &self.watermark {
            if ordering <= *watermark {
                self.skipped += 1;
                return ApplyOutcome::SkippedWatermark;
            }
        }
        if !self.applied_keys.insert(leg.key.clone()) {
            self.skipped += 1;
            return ApplyOutcome::SkippedDuplicate;
        }

        let (qty, cash_delta, realized_delta) = match &leg.action {
            LegAction::Buy { shares, price, fee } => {
                self.position.last_price = Some(*price);
                self.acquire(leg, *shares, *price * *shares + *fee, *fee)
            }
            LegAction::Sell { shares, price, fee } => {
                self.position.last_price = Some(*price);
                self.handle_sell(leg, *shares, *price, *fee)
            }
            LegAction::Split { shares, cost } => self.acquire(leg, *shares, *cost, Decimal::zero()),
            LegAction::Merge { shares, proceeds } => self.handle_merge(leg, *shares, *proceeds),
            LegAction::Redeem {
                shares,
                observed_usdc,
            } => self.handle_redeem(leg, *shares, *observed_usdc),
        };

        self.position.cash_flow += cash_delta;
        self.position.realized_pnl += realized_delta;
        self.position.updated_at = Some(leg.time_ms);

        self.effects.push(Effect {
            event_key: leg.key.clone(),
            partition: self.position.key.clone(),
            kind: leg.action.kind(),
            qty,
            cash_delta,
            realized_delta,
            time_ms: leg.time_ms,
        });

        debug!(
            partition = %self.position.key,
            event = %leg.key,
            kind = leg.action.kind().as_str(),
            quantity = %self.position.quantity,
            cost_basis = %self.position.cost_basis,
            "applied leg"
        );

        self.applied += 1;
        self.watermark = Some(ordering);
        ApplyOutcome::Applied
    }

    /// BUY or SPLIT leg: add shares at `total_cost` (fees included).
    fn acquire(
        &mut self,
        leg: &LegEvent,
        shares: Decimal,
        total_cost: Decimal,
        fee: Decimal,
    ) -> (Decimal, Decimal, Decimal) {
        let old_qty = self.position.quantity;
        let new_qty = old_qty + shares;
        let carried = self.position.cost_basis * old_qty;

        match (carried + total_cost).checked_div(new_qty) {
            Some(basis) => self.position.cost_basis = basis,
            None => {
                self.errors.record(
                    LedgerError::new(
                        LedgerErrorKind::MalformedEvent,
                        "acquisition leaves a zero share balance",
                    )
                    .with_wallet(&self.position.key.wallet)
                    .with_condition(&self.position.key.condition_id)
                    .with_outcome(self.position.key.outcome_index)
                    .with_event(&leg.key),
                );
                return (Decimal::zero(), Decimal::zero(), Decimal::zero());
            }
        }

        if old_qty.is_zero() {
            self.position.opened_at = Some(leg.time_ms);
        }
        self.position.quantity = new_qty;
        self.position.fees_paid += fee;

        (shares, -total_cost, Decimal::zero())
    }

    fn handle_sell(
        &mut self,
        leg: &LegEvent,
        shares: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> (Decimal, Decimal, Decimal) {
        let covered = self.take_inventory(leg, shares, "sell");
        let realized = (price - self.position.cost_basis) * covered - fee;
        self.position.fees_paid += fee;

        (shares, price * shares - fee, realized)
    }

    /// Proportional pseudo-sell at the outcome's average cost.
    fn handle_merge(
        &mut self,
        leg: &LegEvent,
        shares: Decimal,
        proceeds: Decimal,
    ) -> (Decimal, Decimal, Decimal) {
        let covered = self.take_inventory(leg, shares, "merge");
        let covered_proceeds = if covered == shares {
            proceeds
        } else {
            (proceeds * covered)
                .checked_div(shares)
                .unwrap_or_else(Decimal::zero)
        };
        let realized = covered_proceeds - self.position.cost_basis * covered;

        (shares, proceeds, realized)
    }

    fn handle_redeem(
        &mut self,
        leg: &LegEvent,
        shares: Decimal,
        observed_usdc: Decimal,
    ) -> (Decimal, Decimal, Decimal) {
        let outcome = self.position.key.outcome_index;
        let settlement_price = self
            .resolution
            .as_ref()
            .and_then(|r| r.payout_price(outcome))
            .or_else(|| observed_usdc.checked_div(shares))
            .unwrap_or_else(Decimal::zero);

        let covered = shares.min(self.position.quantity);
        let unbacked = shares - covered;
        self.position.quantity -= covered;

        if unbacked.is_positive() {
            self.position.unbacked_redeem_shares += unbacked;
            self.unbacked.push(UnbackedRedeem {
                partition: self.position.key.clone(),
                event_key: leg.key.clone(),
                shares: unbacked,
                observed_usdc,
            });
        }

        let realized = (settlement_price - self.position.cost_basis) * covered;
        (shares, observed_usdc, realized)
    }

    /// Remove up to `shares` from inventory, logging any shortfall. Returns the covered amount.
    fn take_inventory(&mut self, leg: &LegEvent, shares: Decimal, what: &str) -> Decimal {
        let covered = shares.min(self.position.quantity);
        let excess = shares - covered;
        self.position.quantity -= covered;

        if excess.is_positive() {
            self.errors.record(
                LedgerError::new(
                    LedgerErrorKind::InventoryShortfall,
                    format!("{} of {} shares exceeds holdings by {}", what, shares, excess),
                )
                .with_wallet(&self.position.key.wallet)
                .with_condition(&self.position.key.condition_id)
                .with_outcome(self.position.key.outcome_index)
                .with_event(&leg.key),
            );
        }
        covered
    }

    /// Get the accumulated outputs.
    pub fn into_outputs(self) -> FoldOutput {
        FoldOutput {
            position: self.position,
            effects: self.effects,
            errors: self.errors,
            unbacked: self.unbacked,
            watermark: self.watermark,
            applied: self.applied,
            skipped: self.skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, TxHash};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn key() -> PartitionKey {
        PartitionKey::new(Address::new("0xw"), ConditionId::new("0xc"), 0)
    }

    fn leg(time: i64, log: i64, action: LegAction) -> LegEvent {
        LegEvent {
            key: EventKey::new(TxHash::new(format!("0x{:02x}", time)), log),
            time_ms: TimeMs::new(time),
            action,
        }
    }

    fn buy(time: i64, shares: &str, price: &str, fee: &str) -> LegEvent {
        leg(
            time,
            0,
            LegAction::Buy {
                shares: d(shares),
                price: d(price),
                fee: d(fee),
            },
        )
    }

    #[test]
    fn test_buy_capitalizes_fee_into_basis() {
        let mut ledger = PositionLedger::new(key());
        ledger.apply(&buy(1, "100", "0.40", "0.40"));

        let pos = ledger.position();
        assert_eq!(pos.quantity, d("100"));
        assert_eq!(pos.cost_basis, d("0.404"));
        assert_eq!(pos.realized_pnl, Decimal::zero());
        assert_eq!(pos.cash_flow, d("-40.4"));
        assert!(pos.is_open());
    }

    #[test]
    fn test_average_cost_across_buys() {
        let mut ledger = PositionLedger::new(key());
        ledger.apply(&buy(1, "10", "0.2", "0"));
        ledger.apply(&buy(2, "30", "0.6", "0"));
        assert_eq!(ledger.position().cost_basis, d("0.5"));
    }

    #[test]
    fn test_sell_realizes_against_average_cost() {
        let mut ledger = PositionLedger::new(key());
        ledger.apply(&buy(1, "100", "0.40", "0"));
        ledger.apply(&leg(
            2,
            0,
            LegAction::Sell {
                shares: d("40"),
                price: d("0.55"),
                fee: d("0.10"),
            },
        ));

        let pos = ledger.position();
        assert_eq!(pos.quantity, d("60"));
        assert_eq!(pos.cost_basis, d("0.4"));
        assert_eq!(pos.realized_pnl, d("5.9"));
        assert_eq!(pos.last_price, Some(d("0.55")));
    }

    #[test]
    fn test_oversell_logs_shortfall_and_realizes_held_shares_only() {
        let mut ledger = PositionLedger::new(key());
        ledger.apply(&buy(1, "10", "0.5", "0"));
        ledger.apply(&leg(
            2,
            0,
            LegAction::Sell {
                shares: d("15"),
                price: d("0.7"),
                fee: d("0"),
            },
        ));

        let out = ledger.into_outputs();
        assert_eq!(out.position.quantity, Decimal::zero());
        assert_eq!(out.position.realized_pnl, d("2"));
        assert_eq!(out.errors.count(LedgerErrorKind::InventoryShortfall), 1);
    }

    #[test]
    fn test_redeem_on_winner_uses_resolution_price() {
        let resolution = MarketResolution::binary(ConditionId::new("0xc"), 0, TimeMs::new(5));
        let mut ledger = PositionLedger::new(key()).with_resolution(Some(resolution));
        ledger.apply(&buy(1, "100", "0.40", "0.40"));
        ledger.apply(&leg(
            10,
            0,
            LegAction::Redeem {
                shares: d("100"),
                observed_usdc: d("100"),
            },
        ));

        let pos = ledger.position();
        assert_eq!(pos.realized_pnl, d("59.6"));
        assert_eq!(pos.quantity, Decimal::zero());
        assert_eq!(pos.cash_flow, d("59.6"));
    }

    #[test]
    fn test_unbacked_redeem_is_never_credited() {
        let mut ledger = PositionLedger::new(key());
        ledger.apply(&leg(
            3,
            1,
            LegAction::Redeem {
                shares: d("100"),
                observed_usdc: d("100"),
            },
        ));

        let out = ledger.into_outputs();
        assert_eq!(out.position.realized_pnl, Decimal::zero());
        assert_eq!(out.position.unbacked_redeem_shares, d("100"));
        assert_eq!(out.unbacked.len(), 1);
        assert_eq!(out.unbacked[0].shares, d("100"));
    }

    #[test]
    fn test_split_then_merge_nets_zero() {
        let mut ledger = PositionLedger::new(key());
        ledger.apply(&leg(
            1,
            0,
            LegAction::Split {
                shares: d("50"),
                cost: d("25"),
            },
        ));
        ledger.apply(&leg(
            2,
            0,
            LegAction::Merge {
                shares: d("50"),
                proceeds: d("25"),
            },
        ));

        let pos = ledger.position();
        assert_eq!(pos.realized_pnl, Decimal::zero());
        assert_eq!(pos.cash_flow, Decimal::zero());
        assert_eq!(pos.quantity, Decimal::zero());
    }

    #[test]
    fn test_duplicate_event_key_applied_once() {
        let mut ledger = PositionLedger::new(key());
        let event = buy(1, "10", "0.5", "0");
        assert_eq!(ledger.apply(&event), ApplyOutcome::Applied);
        assert_eq!(ledger.apply(&event), ApplyOutcome::SkippedWatermark);
        assert_eq!(ledger.position().quantity, d("10"));
    }

    #[test]
    fn test_applied_key_after_watermark_is_skipped() {
        let event = buy(5, "10", "0.5", "0");
        let mut position = Position::new(key());
        position.quantity = d("10");
        position.cost_basis = d("0.5");

        let applied = HashSet::from([event.key.clone()]);
        let mut resumed = PositionLedger::resume(position, None, applied);
        assert_eq!(resumed.apply(&event), ApplyOutcome::SkippedDuplicate);

        let out = resumed.into_outputs();
        assert_eq!(out.position.quantity, d("10"));
        assert_eq!(out.skipped, 1);
        assert!(out.effects.is_empty());
    }

    #[test]
    fn test_resume_skips_at_or_before_watermark() {
        let first = buy(1, "10", "0.5", "0");
        let second = buy(2, "10", "0.7", "0");

        let mut ledger = PositionLedger::new(key());
        ledger.apply(&first);
        let out = ledger.into_outputs();

        let mut resumed = PositionLedger::resume(out.position, out.watermark, HashSet::new());
        assert_eq!(resumed.apply(&first), ApplyOutcome::SkippedWatermark);
        assert_eq!(resumed.apply(&second), ApplyOutcome::Applied);

        let out = resumed.into_outputs();
        assert_eq!(out.position.quantity, d("20"));
        assert_eq!(out.position.cost_basis, d("0.6"));
        assert_eq!(out.applied, 1);
        assert_eq!(out.skipped, 1);
        assert_eq!(out.effects.len(), 1);
    }

    #[test]
    fn test_position_reopens_after_flat() {
        let mut ledger = PositionLedger::new(key());
        ledger.apply(&buy(1, "10", "0.5", "0"));
        ledger.apply(&leg(
            2,
            0,
            LegAction::Sell {
                shares: d("10"),
                price: d("0.5"),
                fee: d("0"),
            },
        ));
        ledger.apply(&buy(3, "5", "0.2", "0"));

        let pos = ledger.position();
        assert_eq!(pos.quantity, d("5"));
        assert_eq!(pos.cost_basis, d("0.2"));
        assert_eq!(pos.opened_at, Some(TimeMs::new(3)));
    }
}
