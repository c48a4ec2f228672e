//! Token → (condition, outcome) mappings and their immutable, versioned snapshots.

use crate::domain::{ConditionId, Decimal, OutcomeIndex, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How a mapping was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    /// Condition metadata lists the token explicitly.
    Direct,
    /// Inferred from a fill sharing a transaction with a split/merge.
    TxCorrelation,
    /// Chosen by greedy calibration against a wallet's ground-truth P&L.
    Calibrated,
}

impl MappingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingSource::Direct => "direct",
            MappingSource::TxCorrelation => "tx_correlation",
            MappingSource::Calibrated => "calibrated",
        }
    }
}

impl fmt::Display for MappingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MappingSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(MappingSource::Direct),
            "tx_correlation" => Ok(MappingSource::TxCorrelation),
            "calibrated" => Ok(MappingSource::Calibrated),
            other => Err(format!("unknown mapping source: {}", other)),
        }
    }
}

/// Whether a mapping may be used to resolve tokens in production folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Production,
    /// Calibration did not converge within tolerance; withheld until reviewed.
    LowConfidence,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Production => "production",
            MappingStatus::LowConfidence => "low_confidence",
        }
    }
}

impl std::str::FromStr for MappingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(MappingStatus::Production),
            "low_confidence" => Ok(MappingStatus::LowConfidence),
            other => Err(format!("unknown mapping status: {}", other)),
        }
    }
}

/// Mapping of one token to its condition and outcome index.
///
/// This is a property of the condition: every wallet trading the token shares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOutcomeMapping {
    pub token_id: TokenId,
    pub condition_id: ConditionId,
    pub outcome_index: OutcomeIndex,
    pub source: MappingSource,
    /// In [0, 1].
    pub confidence: Decimal,
    pub status: MappingStatus,
}

impl TokenOutcomeMapping {
    pub fn direct(token_id: TokenId, condition_id: ConditionId, outcome_index: OutcomeIndex) -> Self {
        Self {
            token_id,
            condition_id,
            outcome_index,
            source: MappingSource::Direct,
            confidence: Decimal::one(),
            status: MappingStatus::Production,
        }
    }

    pub fn is_production(&self) -> bool {
        self.status == MappingStatus::Production
    }
}

/// Condition metadata for one market: outcome count and tokens in outcome order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionMeta {
    pub condition_id: ConditionId,
    pub outcome_count: u32,
    /// `token_ids[i]` is the token of outcome `i`. May be empty when unknown.
    pub token_ids: Vec<TokenId>,
}

impl ConditionMeta {
    pub fn binary(condition_id: ConditionId) -> Self {
        Self {
            condition_id,
            outcome_count: 2,
            token_ids: Vec::new(),
        }
    }
}

/// Immutable, versioned set of token mappings.
///
/// A fold always binds to exactly one snapshot. Newer derivations produce a new snapshot with
/// a higher version; existing snapshots are never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSnapshot {
    pub version: i64,
    /// SHA-256 over the sorted mapping rows (first 16 bytes, hex).
    pub fingerprint: String,
    mappings: BTreeMap<TokenId, TokenOutcomeMapping>,
}

impl MappingSnapshot {
    pub fn new(version: i64, mappings: BTreeMap<TokenId, TokenOutcomeMapping>) -> Self {
        let fingerprint = Self::compute_fingerprint(&mappings);
        Self {
            version,
            fingerprint,
            mappings,
        }
    }

    /// The empty snapshot every ledger starts from.
    pub fn empty() -> Self {
        Self::new(0, BTreeMap::new())
    }

    pub fn compute_fingerprint(mappings: &BTreeMap<TokenId, TokenOutcomeMapping>) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        for mapping in mappings.values() {
            hasher.update(mapping.token_id.as_str());
            hasher.update([0u8]);
            hasher.update(mapping.condition_id.as_str());
            hasher.update(mapping.outcome_index.to_le_bytes());
            hasher.update(mapping.source.as_str());
            hasher.update(mapping.status.as_str());
            hasher.update(mapping.confidence.to_canonical_string());
            hasher.update([0xffu8]);
        }
        let hash = hasher.finalize();
        hex::encode(&hash[..16])
    }

    /// Any mapping for the token, including withheld low-confidence ones.
    pub fn get(&self, token_id: &TokenId) -> Option<&TokenOutcomeMapping> {
        self.mappings.get(token_id)
    }

    /// Production mapping for the token, if any.
    pub fn resolve(&self, token_id: &TokenId) -> Option<&TokenOutcomeMapping> {
        self.mappings.get(token_id).filter(|m| m.is_production())
    }

    pub fn for_condition<'a>(
        &'a self,
        condition_id: &'a ConditionId,
    ) -> impl Iterator<Item = &'a TokenOutcomeMapping> + 'a {
        self.mappings
            .values()
            .filter(move |m| &m.condition_id == condition_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenOutcomeMapping> {
        self.mappings.values()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Owned copy of the rows, for building the next version.
    pub fn to_map(&self) -> BTreeMap<TokenId, TokenOutcomeMapping> {
        self.mappings.clone()
    }
}
