//! Outcome resolver: token id → (condition, outcome index).
//!
//! `MappingBuilder` derives the next snapshot from direct condition metadata, transaction
//! correlation and calibration results. `OutcomeResolver` attaches a frozen snapshot to trades.

use crate::domain::{
    ConditionId, ConditionMeta, Decimal, ErrorLog, LedgerError, LedgerErrorKind, MappingSnapshot,
    MappingSource, MappingStatus, OutcomeIndex, SettlementEvent, SettlementKind, TokenId,
    TokenOutcomeMapping, TradeEvent, TxHash,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome count assumed for a condition without metadata.
pub const DEFAULT_OUTCOME_COUNT: u32 = 2;

/// Confidence assigned to a mapping inferred by transaction correlation.
const TX_CORRELATION_CONFIDENCE: &str = "0.9";

/// A condition whose tokens could not be mapped without calibration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousCondition {
    pub condition_id: ConditionId,
    pub outcome_count: u32,
    /// Correlated tokens with no production mapping, sorted.
    pub tokens: Vec<TokenId>,
    pub free_outcomes: Vec<OutcomeIndex>,
}

/// Mutable staging area for the next mapping snapshot.
#[derive(Debug, Clone, Default)]
pub struct MappingBuilder {
    rows: BTreeMap<TokenId, TokenOutcomeMapping>,
    outcome_counts: BTreeMap<ConditionId, u32>,
}

impl MappingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the rows of an existing snapshot.
    pub fn from_snapshot(snapshot: &MappingSnapshot) -> Self {
        Self {
            rows: snapshot.to_map(),
            outcome_counts: BTreeMap::new(),
        }
    }

    pub fn outcome_count(&self, condition_id: &ConditionId) -> u32 {
        self.outcome_counts
            .get(condition_id)
            .copied()
            .unwrap_or(DEFAULT_OUTCOME_COUNT)
    }

    /// Direct mappings from a condition's token table. These override any derived mapping.
    pub fn add_condition_meta(&mut self, meta: &ConditionMeta) {
        self.outcome_counts
            .insert(meta.condition_id.clone(), meta.outcome_count);
        for (index, token) in meta.token_ids.iter().enumerate() {
            if token.is_empty() {
                continue;
            }
            self.rows.insert(
                token.clone(),
                TokenOutcomeMapping::direct(
                    token.clone(),
                    meta.condition_id.clone(),
                    index as OutcomeIndex,
                ),
            );
        }
    }

    pub fn has_production_mapping(&self, token_id: &TokenId) -> bool {
        self.rows
            .get(token_id)
            .map(|m| m.is_production())
            .unwrap_or(false)
    }

    /// True when any token of the condition already holds a production mapping.
    pub fn condition_has_production(&self, condition_id: &ConditionId) -> bool {
        self.rows
            .values()
            .any(|m| &m.condition_id == condition_id && m.is_production())
    }

    fn taken_outcomes(&self, condition_id: &ConditionId) -> BTreeSet<OutcomeIndex> {
        self.rows
            .values()
            .filter(|m| &m.condition_id == condition_id && m.is_production())
            .map(|m| m.outcome_index)
            .collect()
    }

    /// Outcome slots of `condition_id` not held by a production mapping, ascending.
    pub fn free_outcomes(&self, condition_id: &ConditionId) -> Vec<OutcomeIndex> {
        let taken = self.taken_outcomes(condition_id);
        (0..self.outcome_count(condition_id))
            .filter(|o| !taken.contains(o))
            .collect()
    }

    /// Infer mappings from fills that share a transaction with a split or merge.
    ///
    /// A fill is linked to a condition only when its transaction touches exactly one condition.
    /// A token is mapped when it is the only unmapped token correlated with the condition and
    /// exactly one outcome slot remains free. Every other correlated condition is returned as
    /// ambiguous.
    pub fn correlate_transactions(
        &mut self,
        trades: &[TradeEvent],
        settlements: &[SettlementEvent],
    ) -> Vec<AmbiguousCondition> {
        let mut tx_conditions: HashMap<&TxHash, BTreeSet<&ConditionId>> = HashMap::new();
        for event in settlements {
            if matches!(event.kind, SettlementKind::Split | SettlementKind::Merge) {
                tx_conditions
                    .entry(&event.key.tx_hash)
                    .or_default()
                    .insert(&event.condition_id);
            }
        }

        let mut correlated: BTreeMap<ConditionId, BTreeSet<TokenId>> = BTreeMap::new();
        for trade in trades {
            if self.has_production_mapping(&trade.token_id) {
                continue;
            }
            let Some(conditions) = tx_conditions.get(&trade.key.tx_hash) else {
                continue;
            };
            if conditions.len() != 1 {
                debug!(
                    tx = %trade.key.tx_hash,
                    conditions = conditions.len(),
                    "transaction touches several conditions, skipping correlation"
                );
                continue;
            }
            if let Some(condition_id) = conditions.iter().next() {
                correlated
                    .entry((*condition_id).clone())
                    .or_default()
                    .insert(trade.token_id.clone());
            }
        }

        let mut ambiguous = Vec::new();
        for (condition_id, tokens) in correlated {
            let outcome_count = self.outcome_count(&condition_id);
            let free_outcomes = self.free_outcomes(&condition_id);

            if tokens.len() == 1 && free_outcomes.len() == 1 {
                if let Some(token) = tokens.into_iter().next() {
                    let outcome_index = free_outcomes[0];
                    info!(
                        token = %token,
                        condition = %condition_id,
                        outcome = outcome_index,
                        "mapped token by transaction correlation"
                    );
                    self.rows.insert(
                        token.clone(),
                        TokenOutcomeMapping {
                            token_id: token,
                            condition_id,
                            outcome_index,
                            source: MappingSource::TxCorrelation,
                            confidence: Decimal::from_str_canonical(TX_CORRELATION_CONFIDENCE)
                                .unwrap_or_else(|_| Decimal::zero()),
                            status: MappingStatus::Production,
                        },
                    );
                }
            } else {
                ambiguous.push(AmbiguousCondition {
                    condition_id,
                    outcome_count,
                    tokens: tokens.into_iter().collect(),
                    free_outcomes,
                });
            }
        }
        ambiguous
    }

    /// Stage calibrated mappings. Tokens with a direct mapping are never overridden.
    pub fn insert_calibrated(&mut self, mappings: impl IntoIterator<Item = TokenOutcomeMapping>) {
        for mapping in mappings {
            let direct = self
                .rows
                .get(&mapping.token_id)
                .map(|m| m.source == MappingSource::Direct)
                .unwrap_or(false);
            if !direct {
                self.rows.insert(mapping.token_id.clone(), mapping);
            }
        }
    }

    /// Freeze the staged rows into an immutable snapshot.
    pub fn freeze(self, version: i64) -> MappingSnapshot {
        MappingSnapshot::new(version, self.rows)
    }
}

/// Trades split by whether their token resolved.
#[derive(Debug, Clone, Default)]
pub struct AttachedTrades {
    pub mapped: Vec<TradeEvent>,
    pub unmapped: Vec<TradeEvent>,
    pub errors: ErrorLog,
    /// Distinct (wallet, token) pairs without a production mapping.
    pub unmapped_positions: usize,
}

/// Read-only resolver bound to one snapshot version.
#[derive(Debug, Clone)]
pub struct OutcomeResolver {
    snapshot: Arc<MappingSnapshot>,
}

impl OutcomeResolver {
    pub fn new(snapshot: Arc<MappingSnapshot>) -> Self {
        Self { snapshot }
    }

    pub fn version(&self) -> i64 {
        self.snapshot.version
    }

    pub fn snapshot(&self) -> &Arc<MappingSnapshot> {
        &self.snapshot
    }

    /// Production mapping for the token: (condition, outcome, confidence).
    pub fn resolve(&self, token_id: &TokenId) -> Option<(ConditionId, OutcomeIndex, Decimal)> {
        self.snapshot
            .resolve(token_id)
            .map(|m| (m.condition_id.clone(), m.outcome_index, m.confidence))
    }

    /// Attach condition and outcome to every trade whose token has a production mapping.
    ///
    /// Unmapped tokens are logged once per (wallet, token).
    pub fn attach(&self, trades: &[TradeEvent]) -> AttachedTrades {
        let mut out = AttachedTrades::default();
        let mut reported = HashSet::new();

        for trade in trades {
            match self.resolve(&trade.token_id) {
                Some((condition_id, outcome_index, _)) => {
                    out.mapped.push(trade.with_outcome(condition_id, outcome_index));
                }
                None => {
                    if reported.insert((trade.wallet.clone(), trade.token_id.clone())) {
                        let withheld = self.snapshot.get(&trade.token_id).is_some();
                        let detail = if withheld {
                            "token mapping is withheld pending review"
                        } else {
                            "no mapping for token"
                        };
                        out.errors.record(
                            LedgerError::new(LedgerErrorKind::UnmappedToken, detail)
                                .with_wallet(&trade.wallet)
                                .with_token(&trade.token_id),
                        );
                    }
                    out.unmapped.push(trade.unmapped());
                }
            }
        }
        out.unmapped_positions = reported.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, EventKey, Side, TimeMs};

    fn trade(token: &str, tx: &str) -> TradeEvent {
        TradeEvent {
            key: EventKey::new(TxHash::new(tx), 0),
            wallet: Address::new("0xa"),
            token_id: TokenId::new(token),
            condition_id: None,
            outcome_index: None,
            side: Side::Buy,
            shares: Decimal::one(),
            price: Decimal::from_str_canonical("0.5").unwrap(),
            fee: Decimal::zero(),
            time_ms: TimeMs::new(1),
        }
    }

    fn split(condition: &str, tx: &str) -> SettlementEvent {
        SettlementEvent {
            key: EventKey::new(TxHash::new(tx), 1),
            wallet: Address::new("0xa"),
            condition_id: ConditionId::new(condition),
            outcome_index: None,
            kind: SettlementKind::Split,
            shares: Decimal::one(),
            usdc_delta: -Decimal::one(),
            time_ms: TimeMs::new(1),
        }
    }

    #[test]
    fn test_direct_mapping_from_meta() {
        let mut builder = MappingBuilder::new();
        builder.add_condition_meta(&ConditionMeta {
            condition_id: ConditionId::new("0xc1"),
            outcome_count: 2,
            token_ids: vec![TokenId::new("yes"), TokenId::new("no")],
        });
        let resolver = OutcomeResolver::new(Arc::new(builder.freeze(1)));

        let (condition, outcome, confidence) = resolver.resolve(&TokenId::new("no")).unwrap();
        assert_eq!(condition, ConditionId::new("0xc1"));
        assert_eq!(outcome, 1);
        assert_eq!(confidence, Decimal::one());
    }

    #[test]
    fn test_tx_correlation_fills_last_free_slot() {
        let mut builder = MappingBuilder::new();
        builder.add_condition_meta(&ConditionMeta {
            condition_id: ConditionId::new("0xc1"),
            outcome_count: 2,
            token_ids: vec![TokenId::new("yes")],
        });

        let ambiguous = builder.correlate_transactions(
            &[trade("mystery", "0x11")],
            &[split("0xc1", "0x11")],
        );
        assert!(ambiguous.is_empty());

        let snapshot = builder.freeze(2);
        let mapping = snapshot.resolve(&TokenId::new("mystery")).unwrap();
        assert_eq!(mapping.outcome_index, 1);
        assert_eq!(mapping.source, MappingSource::TxCorrelation);
        assert_eq!(mapping.confidence, Decimal::from_str_canonical("0.9").unwrap());
    }

    #[test]
    fn test_tx_correlation_reports_ambiguity() {
        let mut builder = MappingBuilder::new();
        let ambiguous = builder.correlate_transactions(
            &[trade("a", "0x11"), trade("b", "0x12")],
            &[split("0xc1", "0x11"), split("0xc1", "0x12")],
        );

        assert_eq!(ambiguous.len(), 1);
        assert_eq!(ambiguous[0].tokens, vec![TokenId::new("a"), TokenId::new("b")]);
        assert_eq!(ambiguous[0].free_outcomes, vec![0, 1]);
        assert!(builder.freeze(1).is_empty());
    }

    #[test]
    fn test_multi_condition_transaction_is_not_correlated() {
        let mut builder = MappingBuilder::new();
        let ambiguous = builder.correlate_transactions(
            &[trade("a", "0x11")],
            &[split("0xc1", "0x11"), split("0xc2", "0x11")],
        );
        assert!(ambiguous.is_empty());
        assert!(builder.freeze(1).is_empty());
    }

    #[test]
    fn test_attach_logs_unmapped_once_per_wallet_token() {
        let resolver = OutcomeResolver::new(Arc::new(MappingSnapshot::empty()));
        let attached = resolver.attach(&[trade("x", "0x01"), trade("x", "0x02"), trade("y", "0x03")]);

        assert!(attached.mapped.is_empty());
        assert_eq!(attached.unmapped.len(), 3);
        assert_eq!(attached.unmapped_positions, 2);
        assert_eq!(attached.errors.count(LedgerErrorKind::UnmappedToken), 2);
    }

    #[test]
    fn test_calibrated_never_overrides_direct() {
        let mut builder = MappingBuilder::new();
        builder.add_condition_meta(&ConditionMeta {
            condition_id: ConditionId::new("0xc1"),
            outcome_count: 2,
            token_ids: vec![TokenId::new("yes"), TokenId::new("no")],
        });
        builder.insert_calibrated(vec![TokenOutcomeMapping {
            token_id: TokenId::new("yes"),
            condition_id: ConditionId::new("0xc1"),
            outcome_index: 1,
            source: MappingSource::Calibrated,
            confidence: Decimal::one(),
            status: MappingStatus::Production,
        }]);
        let snapshot = builder.freeze(1);
        assert_eq!(snapshot.resolve(&TokenId::new("yes")).unwrap().outcome_index, 0);
    }
}
