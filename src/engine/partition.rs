//! Partitioning of events by (wallet, condition, outcome) and the concurrent fold.

use crate::domain::{
    ConditionId, Decimal, ErrorLog, EventKey, EventOrderingKey, LedgerError, LedgerErrorKind,
    MarketResolution, OutcomeIndex, SettlementEvent, SettlementKind, Side, TradeEvent,
};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

use super::ledger::{FoldOutput, Position, PositionLedger, UnbackedRedeem};
use super::resolver::DEFAULT_OUTCOME_COUNT;
use super::{LegAction, LegEvent, PartitionKey};

/// Legs grouped per partition, each list in ordering-key order.
#[derive(Debug, Clone, Default)]
pub struct PartitionedEvents {
    pub partitions: BTreeMap<PartitionKey, Vec<LegEvent>>,
    pub errors: ErrorLog,
}

impl PartitionedEvents {
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Route mapped trades and settlements to their partitions.
///
/// Trades without an attached mapping are ignored. SPLIT and MERGE fan out to every outcome
/// of their condition, dividing the USDC evenly; the outcome count comes from `outcome_counts`
/// and defaults to binary.
pub fn partition_events(
    trades: &[TradeEvent],
    settlements: &[SettlementEvent],
    outcome_counts: &HashMap<ConditionId, u32>,
) -> PartitionedEvents {
    let mut out = PartitionedEvents::default();

    for trade in trades {
        let (Some(condition_id), Some(outcome_index)) = (&trade.condition_id, trade.outcome_index)
        else {
            continue;
        };
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
        out.partitions
            .entry(PartitionKey::new(
                trade.wallet.clone(),
                condition_id.clone(),
                outcome_index,
            ))
            .or_default()
            .push(LegEvent {
                key: trade.key.clone(),
                time_ms: trade.time_ms,
                action,
            });
    }

    for event in settlements {
        match event.kind {
            SettlementKind::Split | SettlementKind::Merge => {
                let outcome_count = outcome_counts
                    .get(&event.condition_id)
                    .copied()
                    .unwrap_or(DEFAULT_OUTCOME_COUNT)
                    .max(1);
                let per_outcome = event
                    .usdc_delta
                    .abs()
                    .checked_div(Decimal::from_u64(outcome_count as u64))
                    .unwrap_or_else(Decimal::zero);

                for outcome_index in 0..outcome_count {
                    let action = if event.kind == SettlementKind::Split {
                        LegAction::Split {
                            shares: event.shares,
                            cost: per_outcome,
                        }
                    } else {
                        LegAction::Merge {
                            shares: event.shares,
                            proceeds: per_outcome,
                        }
                    };
                    push_settlement_leg(&mut out, event, outcome_index, action);
                }
            }
            SettlementKind::Redeem => match event.outcome_index {
                Some(outcome_index) => {
                    let action = LegAction::Redeem {
                        shares: event.shares,
                        observed_usdc: event.usdc_delta,
                    };
                    push_settlement_leg(&mut out, event, outcome_index, action);
                }
                None => out.errors.record(
                    LedgerError::new(LedgerErrorKind::MalformedEvent, "redeem without outcome index")
                        .with_wallet(&event.wallet)
                        .with_condition(&event.condition_id)
                        .with_event(&event.key),
                ),
            },
        }
    }

    for legs in out.partitions.values_mut() {
        legs.sort_by_cached_key(LegEvent::ordering_key);
    }
    out
}

fn push_settlement_leg(
    out: &mut PartitionedEvents,
    event: &SettlementEvent,
    outcome_index: OutcomeIndex,
    action: LegAction,
) {
    out.partitions
        .entry(PartitionKey::new(
            event.wallet.clone(),
            event.condition_id.clone(),
            outcome_index,
        ))
        .or_default()
        .push(LegEvent {
            key: event.key.clone(),
            time_ms: event.time_ms,
            action,
        });
}

/// Everything needed to fold one partition.
#[derive(Debug, Clone)]
pub struct FoldInput {
    pub position: Position,
    pub watermark: Option<EventOrderingKey>,
    pub applied_keys: HashSet<EventKey>,
    pub resolution: Option<MarketResolution>,
    pub legs: Vec<LegEvent>,
}

impl FoldInput {
    /// A fresh partition with no history.
    pub fn fresh(
        key: PartitionKey,
        legs: Vec<LegEvent>,
        resolution: Option<MarketResolution>,
    ) -> Self {
        Self {
            position: Position::new(key),
            watermark: None,
            applied_keys: HashSet::new(),
            resolution,
            legs,
        }
    }
}

fn fold_one(input: FoldInput) -> FoldOutput {
    let key = input.position.key.clone();
    let mut ledger = PositionLedger::resume(input.position, input.watermark, input.applied_keys)
        .with_resolution(input.resolution);
    for leg in &input.legs {
        ledger.apply(leg);
    }
    let out = ledger.into_outputs();
    debug!(
        partition = %key,
        applied = out.applied,
        skipped = out.skipped,
        "folded partition"
    );
    out
}

/// Fold partitions one after another on the current thread.
pub fn fold_all(inputs: Vec<FoldInput>) -> Vec<FoldOutput> {
    inputs.into_iter().map(fold_one).collect()
}

/// Fold partitions concurrently on `pool`. Output order matches input order.
pub fn fold_partitions(pool: &rayon::ThreadPool, inputs: Vec<FoldInput>) -> Vec<FoldOutput> {
    pool.install(|| inputs.into_par_iter().map(fold_one).collect())
}

/// Turn unbacked redemptions into `MappingInconsistent` entries.
///
/// `positions` must hold every known position of the affected wallets after the fold, so a
/// sibling outcome carrying the cost basis can be named. Returns the log and the conditions
/// that need re-resolution.
pub fn flag_mapping_inconsistencies(
    unbacked: &[UnbackedRedeem],
    positions: &BTreeMap<PartitionKey, Position>,
) -> (ErrorLog, BTreeSet<ConditionId>) {
    let mut errors = ErrorLog::new();
    let mut conditions = BTreeSet::new();

    for redeem in unbacked {
        let key = &redeem.partition;
        let sibling = positions
            .values()
            .filter(|p| {
                p.key.wallet == key.wallet
                    && p.key.condition_id == key.condition_id
                    && p.key.outcome_index != key.outcome_index
                    && (p.is_open() || !p.cost_basis.is_zero())
            })
            .max_by(|a, b| a.quantity.cmp(&b.quantity))
            .map(|p| p.key.outcome_index);

        let detail = match sibling {
            Some(other) => format!(
                "redeemed {} shares of outcome {} with no basis; basis held under outcome {}",
                redeem.shares, key.outcome_index, other
            ),
            None => format!(
                "redeemed {} shares of outcome {} with no basis under any outcome",
                redeem.shares, key.outcome_index
            ),
        };
        errors.record(
            LedgerError::new(LedgerErrorKind::MappingInconsistent, detail)
                .with_wallet(&key.wallet)
                .with_condition(&key.condition_id)
                .with_outcome(key.outcome_index)
                .with_event(&redeem.event_key),
        );
        conditions.insert(key.condition_id.clone());
    }
    (errors, conditions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, TimeMs, TokenId, TxHash};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn cond() -> ConditionId {
        ConditionId::new("0xc0")
    }

    fn wallet() -> Address {
        Address::new("0xa1")
    }

    fn mapped_buy(time: i64, outcome: OutcomeIndex, shares: &str, price: &str) -> TradeEvent {
        TradeEvent {
            key: EventKey::new(TxHash::new(format!("0x{:x}", time)), 0),
            wallet: wallet(),
            token_id: TokenId::new(format!("t{}", outcome)),
            condition_id: Some(cond()),
            outcome_index: Some(outcome),
            side: Side::Buy,
            shares: d(shares),
            price: d(price),
            fee: Decimal::zero(),
            time_ms: TimeMs::new(time),
        }
    }

    fn settlement(time: i64, kind: SettlementKind, outcome: Option<u32>, usdc: &str) -> SettlementEvent {
        SettlementEvent {
            key: EventKey::new(TxHash::new(format!("0x{:x}", time)), 1),
            wallet: wallet(),
            condition_id: cond(),
            outcome_index: outcome,
            kind,
            shares: d("30"),
            usdc_delta: d(usdc),
            time_ms: TimeMs::new(time),
        }
    }

    #[test]
    fn test_split_fans_out_to_every_outcome() {
        let mut counts = HashMap::new();
        counts.insert(cond(), 3);
        let parts = partition_events(
            &[],
            &[settlement(5, SettlementKind::Split, None, "-30")],
            &counts,
        );

        assert_eq!(parts.len(), 3);
        for legs in parts.partitions.values() {
            assert_eq!(
                legs[0].action,
                LegAction::Split {
                    shares: d("30"),
                    cost: d("10")
                }
            );
        }
    }

    #[test]
    fn test_unmapped_trades_are_ignored() {
        let mut trade = mapped_buy(1, 0, "1", "0.5");
        trade.condition_id = None;
        let parts = partition_events(&[trade], &[], &HashMap::new());
        assert!(parts.is_empty());
    }

    #[test]
    fn test_legs_sorted_within_partition() {
        let parts = partition_events(
            &[mapped_buy(9, 0, "1", "0.5"), mapped_buy(2, 0, "1", "0.5")],
            &[],
            &HashMap::new(),
        );
        let legs = parts.partitions.values().next().unwrap();
        assert_eq!(legs[0].time_ms, TimeMs::new(2));
        assert_eq!(legs[1].time_ms, TimeMs::new(9));
    }

    #[test]
    fn test_parallel_fold_matches_sequential() {
        let trades = vec![
            mapped_buy(1, 0, "30", "0.5"),
            mapped_buy(2, 1, "100", "0.4"),
            mapped_buy(3, 0, "10", "0.6"),
        ];
        let parts = partition_events(&trades, &[], &HashMap::new());
        let inputs: Vec<FoldInput> = parts
            .partitions
            .into_iter()
            .map(|(key, legs)| FoldInput::fresh(key, legs, None))
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap();
        let parallel = fold_partitions(&pool, inputs.clone());
        let sequential = fold_all(inputs);

        let a: Vec<_> = parallel.iter().map(|o| o.position.clone()).collect();
        let b: Vec<_> = sequential.iter().map(|o| o.position.clone()).collect();
        assert_eq!(a, b);
        assert_eq!(a[0].quantity, d("40"));
    }

    #[test]
    fn test_unbacked_redeem_names_sibling_outcome() {
        let parts = partition_events(
            &[mapped_buy(1, 1, "100", "0.4")],
            &[settlement(9, SettlementKind::Redeem, Some(0), "30")],
            &HashMap::new(),
        );
        let inputs: Vec<FoldInput> = parts
            .partitions
            .into_iter()
            .map(|(key, legs)| FoldInput::fresh(key, legs, None))
            .collect();
        let outputs = fold_all(inputs);

        let unbacked: Vec<UnbackedRedeem> =
            outputs.iter().flat_map(|o| o.unbacked.clone()).collect();
        let positions: BTreeMap<PartitionKey, Position> = outputs
            .iter()
            .map(|o| (o.position.key.clone(), o.position.clone()))
            .collect();

        let (errors, conditions) = flag_mapping_inconsistencies(&unbacked, &positions);
        assert_eq!(errors.count(LedgerErrorKind::MappingInconsistent), 1);
        assert!(conditions.contains(&cond()));
        let entry = errors.iter().next().unwrap();
        assert_eq!(entry.outcome_index, Some(0));
        assert!(entry.detail.contains("outcome 1"));
        assert!(positions.values().all(|p| p.realized_pnl.is_zero()));
    }
}
