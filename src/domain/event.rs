//! Canonical ledger events produced by the normalizer.

use crate::domain::{Address, ConditionId, Decimal, OutcomeIndex, Side, TimeMs, TokenId, TxHash};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an on-chain event: `(tx_hash, log_index)`.
///
/// Used for deduplication at ingestion and for replay protection in the fold.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub tx_hash: TxHash,
    pub log_index: i64,
}

impl EventKey {
    pub fn new(tx_hash: TxHash, log_index: i64) -> Self {
        Self { tx_hash, log_index }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

/// A single fill, after direction classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub key: EventKey,
    /// Owner wallet (proxies already rewritten).
    pub wallet: Address,
    pub token_id: TokenId,
    /// Set once the token has been resolved to a condition.
    pub condition_id: Option<ConditionId>,
    /// Set once the token has been resolved to an outcome.
    pub outcome_index: Option<OutcomeIndex>,
    pub side: Side,
    /// Always > 0.
    pub shares: Decimal,
    /// Per-share price in [0, 1].
    pub price: Decimal,
    /// Always >= 0.
    pub fee: Decimal,
    pub time_ms: TimeMs,
}

impl TradeEvent {
    /// `price * shares`, excluding fees.
    pub fn notional(&self) -> Decimal {
        self.price * self.shares
    }

    pub fn is_mapped(&self) -> bool {
        self.condition_id.is_some() && self.outcome_index.is_some()
    }

    /// Copy of this event with its resolved condition and outcome attached.
    pub fn with_outcome(&self, condition_id: ConditionId, outcome_index: OutcomeIndex) -> Self {
        let mut mapped = self.clone();
        mapped.condition_id = Some(condition_id);
        mapped.outcome_index = Some(outcome_index);
        mapped
    }

    /// Copy of this event with any previously attached mapping removed.
    pub fn unmapped(&self) -> Self {
        let mut bare = self.clone();
        bare.condition_id = None;
        bare.outcome_index = None;
        bare
    }
}

/// Conditional-token settlement operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementKind {
    /// Collateral in, one full set of outcome tokens out.
    Split,
    /// One full set of outcome tokens in, collateral out.
    Merge,
    /// Winning tokens in, payout out.
    Redeem,
}

impl SettlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementKind::Split => "split",
            SettlementKind::Merge => "merge",
            SettlementKind::Redeem => "redeem",
        }
    }
}

impl fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SettlementKind {
    type Err = String;

    /// Accepts both short names and the on-chain event names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "split" | "positionsplit" => Ok(SettlementKind::Split),
            "merge" | "positionsmerge" => Ok(SettlementKind::Merge),
            "redeem" | "payoutredemption" => Ok(SettlementKind::Redeem),
            other => Err(format!("unknown settlement kind: {}", other)),
        }
    }
}

/// A split, merge or redemption on a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub key: EventKey,
    pub wallet: Address,
    pub condition_id: ConditionId,
    /// `None` for SPLIT/MERGE (they touch every outcome). Required for REDEEM.
    pub outcome_index: Option<OutcomeIndex>,
    pub kind: SettlementKind,
    pub shares: Decimal,
    /// Signed from the wallet's perspective: negative for SPLIT, positive for MERGE/REDEEM.
    pub usdc_delta: Decimal,
    pub time_ms: TimeMs,
}
