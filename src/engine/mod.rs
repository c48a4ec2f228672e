//! Pure computation engine(s) for deterministic ledger logic.

use crate::domain::{
    Address, ConditionId, Decimal, EventKey, EventOrderingKey, OutcomeIndex, TimeMs,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod aggregator;
pub mod calibration;
pub mod ledger;
pub mod normalizer;
pub mod partition;
pub mod pooled;
pub mod resolver;
pub mod settlement;

pub use aggregator::{aggregate_market, aggregate_wallet, WalletAggregateInput};
pub use calibration::{
    calibrate, evaluate_assignment, CalibrationConfig, CalibrationOutcome, CalibrationProblem,
    GroundTruth, GroundTruthMethod,
};
pub use ledger::{ApplyOutcome, FoldOutput, Position, PositionLedger, UnbackedRedeem};
pub use normalizer::{
    NormalizedBatch, Normalizer, ProxyMap, RawFill, RawRecord, RawSettlement,
};
pub use partition::{
    flag_mapping_inconsistencies, fold_all, fold_partitions, partition_events, FoldInput,
    PartitionedEvents,
};
pub use pooled::pooled_realized_pnl;
pub use resolver::{AmbiguousCondition, AttachedTrades, MappingBuilder, OutcomeResolver};
pub use settlement::{settle_all, settle_position, PositionStatus, SettledPosition};

/// Accounting partition: one outcome of one condition held by one wallet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub wallet: Address,
    pub condition_id: ConditionId,
    pub outcome_index: OutcomeIndex,
}

impl PartitionKey {
    pub fn new(wallet: Address, condition_id: ConditionId, outcome_index: OutcomeIndex) -> Self {
        Self {
            wallet,
            condition_id,
            outcome_index,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.wallet, self.condition_id, self.outcome_index
        )
    }
}

/// One event after routing to a single partition.
///
/// SPLIT and MERGE produce one leg per outcome, each carrying its share of the USDC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegEvent {
    pub key: EventKey,
    pub time_ms: TimeMs,
    pub action: LegAction,
}

impl LegEvent {
    pub fn ordering_key(&self) -> EventOrderingKey {
        EventOrderingKey::new(self.time_ms, &self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegAction {
    Buy {
        shares: Decimal,
        price: Decimal,
        fee: Decimal,
    },
    Sell {
        shares: Decimal,
        price: Decimal,
        fee: Decimal,
    },
    /// `cost` is this outcome's share of the collateral paid in.
    Split { shares: Decimal, cost: Decimal },
    /// `proceeds` is this outcome's share of the collateral paid out.
    Merge { shares: Decimal, proceeds: Decimal },
    /// `observed_usdc` is the payout seen on-chain for the whole redemption.
    Redeem {
        shares: Decimal,
        observed_usdc: Decimal,
    },
}

impl LegAction {
    pub fn kind(&self) -> EffectKind {
        match self {
            LegAction::Buy { .. } => EffectKind::Buy,
            LegAction::Sell { .. } => EffectKind::Sell,
            LegAction::Split { .. } => EffectKind::Split,
            LegAction::Merge { .. } => EffectKind::Merge,
            LegAction::Redeem { .. } => EffectKind::Redeem,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Buy,
    Sell,
    Split,
    Merge,
    Redeem,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::Buy => "buy",
            EffectKind::Sell => "sell",
            EffectKind::Split => "split",
            EffectKind::Merge => "merge",
            EffectKind::Redeem => "redeem",
        }
    }
}

impl std::str::FromStr for EffectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(EffectKind::Buy),
            "sell" => Ok(EffectKind::Sell),
            "split" => Ok(EffectKind::Split),
            "merge" => Ok(EffectKind::Merge),
            "redeem" => Ok(EffectKind::Redeem),
            other => Err(format!("unknown effect kind: {}", other)),
        }
    }
}

/// The effect of one applied leg on its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effect {
    pub event_key: EventKey,
    pub partition: PartitionKey,
    pub kind: EffectKind,
    /// Shares moved by this leg.
    pub qty: Decimal,
    /// Signed USDC from the wallet's perspective, fees included.
    pub cash_delta: Decimal,
    pub realized_delta: Decimal,
    pub time_ms: TimeMs,
}
