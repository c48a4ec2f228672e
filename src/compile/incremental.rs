//! Incremental compilation: fold a wallet's stored events into its ledger tables.

use crate::db::{FoldCommit, Repository};
use crate::domain::{
    Address, ConditionId, ErrorLog, LedgerErrorKind, MappingSnapshot, SettlementPolicy,
};
use crate::engine::{
    flag_mapping_inconsistencies, fold_partitions, partition_events, settle_all, FoldInput,
    OutcomeResolver, PartitionKey, Position, UnbackedRedeem,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::FoldWatermark;

/// Error kinds recomputed from scratch on every compile of a wallet.
const REFRESHED_KINDS: [LedgerErrorKind; 2] = [
    LedgerErrorKind::UnmappedToken,
    LedgerErrorKind::ResolutionMissing,
];

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to build fold worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("fold task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Summary of one wallet compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileReport {
    pub wallet: Address,
    pub mapping_version: i64,
    pub partitions_folded: usize,
    pub events_applied: usize,
    pub events_skipped: usize,
    /// Events that arrived after their partition's watermark had moved past them.
    pub late_events: usize,
    /// True when the wallet was refolded from scratch.
    pub rebuilt: bool,
    pub errors_recorded: usize,
    /// Conditions holding redeemed shares that no mapped inventory backs.
    pub reresolve_conditions: Vec<ConditionId>,
}

enum FoldAttempt {
    Done(CompileReport),
    LateEvents(usize),
}

/// Compiler for incremental ledger folds.
///
/// Partitions of one wallet fold concurrently on a dedicated rayon pool; the async caller
/// waits on `spawn_blocking` so the runtime threads stay free.
#[derive(Clone)]
pub struct Compiler {
    pool: Arc<rayon::ThreadPool>,
}

impl Compiler {
    pub fn new(workers: usize) -> Result<Self, CompileError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("ledger-fold-{}", i))
            .build()?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Compile a wallet, folding only events after each partition's watermark.
    ///
    /// The wallet is refolded from scratch when any watermark belongs to an older mapping
    /// snapshot, or when an event shows up behind a watermark it should have preceded.
    ///
    /// # Errors
    /// Returns an error if database operations or the fold task fail. A failed compile leaves
    /// the previous watermarks intact.
    pub async fn compile_wallet(
        &self,
        repo: &Repository,
        wallet: &Address,
    ) -> Result<CompileReport, CompileError> {
        let snapshot = Arc::new(repo.current_snapshot().await?);
        let watermarks = repo.watermarks_for_wallet(wallet).await?;
        let mut rebuild = watermarks.iter().any(|w| w.is_stale(snapshot.version));
        if rebuild {
            info!(
                wallet = %wallet,
                mapping_version = snapshot.version,
                "watermarks stale or invalidated, rebuilding wallet"
            );
        }
        let mut late_events = 0usize;

        loop {
            if rebuild {
                repo.clear_wallet_ledger(wallet).await?;
            }
            match self
                .fold_wallet(repo, wallet, snapshot.clone(), rebuild)
                .await?
            {
                FoldAttempt::Done(mut report) => {
                    report.late_events = late_events;
                    return Ok(report);
                }
                FoldAttempt::LateEvents(count) => {
                    warn!(
                        wallet = %wallet,
                        late_events = count,
                        "events arrived behind their watermark, rebuilding wallet"
                    );
                    late_events = count;
                    rebuild = true;
                }
            }
        }
    }

    async fn fold_wallet(
        &self,
        repo: &Repository,
        wallet: &Address,
        snapshot: Arc<MappingSnapshot>,
        rebuilt: bool,
    ) -> Result<FoldAttempt, CompileError> {
        let mapping_version = snapshot.version;
        let resolver = OutcomeResolver::new(snapshot);

        let watermarks: HashMap<PartitionKey, FoldWatermark> = repo
            .watermarks_for_wallet(wallet)
            .await?
            .into_iter()
            .map(|w| (w.partition.clone(), w))
            .collect();
        let mut positions: BTreeMap<PartitionKey, Position> = repo
            .positions_for_wallet(wallet)
            .await?
            .into_iter()
            .map(|p| (p.key.clone(), p))
            .collect();
        let mut applied_keys = repo.applied_keys_for_wallet(wallet).await?;

        let trades = repo.trades_for_wallet(wallet).await?;
        let settlements = repo.settlements_for_wallet(wallet).await?;
        let resolutions = repo.resolutions().await?;
        let outcome_counts = repo.outcome_counts().await?;

        let attached = resolver.attach(&trades);
        let mut errors = ErrorLog::new();
        errors.extend(attached.errors);

        let parts = partition_events(&attached.mapped, &settlements, &outcome_counts);
        errors.extend(parts.errors);

        let mut inputs = Vec::new();
        let mut late = 0usize;
        for (key, legs) in parts.partitions {
            let watermark = watermarks.get(&key);
            let applied = applied_keys.remove(&key).unwrap_or_default();

            let pending = match watermark {
                None => legs.len(),
                Some(w) => {
                    late += legs
                        .iter()
                        .filter(|leg| w.covers(&leg.ordering_key()) && !applied.contains(&leg.key))
                        .count();
                    legs.iter()
                        .filter(|leg| !w.covers(&leg.ordering_key()))
                        .count()
                }
            };
            if pending == 0 {
                continue;
            }

            inputs.push(FoldInput {
                position: positions
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| Position::new(key.clone())),
                watermark: watermark.map(|w| w.last.clone()),
                applied_keys: applied,
                resolution: resolutions.get(&key.condition_id).cloned(),
                legs,
            });
        }

        if late > 0 && !rebuilt {
            return Ok(FoldAttempt::LateEvents(late));
        }

        let partitions_folded = inputs.len();
        let pool = self.pool.clone();
        let outputs = tokio::task::spawn_blocking(move || fold_partitions(&pool, inputs)).await?;

        let mut effects = Vec::new();
        let mut new_watermarks = Vec::new();
        let mut unbacked: Vec<UnbackedRedeem> = Vec::new();
        let mut changed = Vec::new();
        let mut events_applied = 0usize;
        let mut events_skipped = 0usize;

        for out in outputs {
            events_applied += out.applied;
            events_skipped += out.skipped;
            if let Some(last) = out.watermark.clone() {
                new_watermarks.push(FoldWatermark::new(
                    out.position.key.clone(),
                    last,
                    mapping_version,
                ));
            }
            effects.extend(out.effects);
            unbacked.extend(out.unbacked);
            errors.extend(out.errors);
            positions.insert(out.position.key.clone(), out.position.clone());
            changed.push(out.position);
        }

        let (inconsistent, mut reresolve) = flag_mapping_inconsistencies(&unbacked, &positions);
        errors.extend(inconsistent);
        // stays requested until a refold under a better mapping backs the redemption
        reresolve.extend(
            positions
                .values()
                .filter(|p| p.unbacked_redeem_shares.is_positive())
                .map(|p| p.key.condition_id.clone()),
        );

        let (_, missing) = settle_all(positions.values(), &resolutions, SettlementPolicy::default());
        errors.extend(missing);

        let error_rows = errors.into_vec();
        let errors_recorded = repo
            .commit_fold(&FoldCommit {
                wallet,
                positions: &changed,
                effects: &effects,
                watermarks: &new_watermarks,
                errors: &error_rows,
                refreshed_kinds: &REFRESHED_KINDS,
            })
            .await?;

        info!(
            wallet = %wallet,
            mapping_version,
            partitions = partitions_folded,
            applied = events_applied,
            skipped = events_skipped,
            rebuilt,
            "compiled wallet"
        );

        Ok(FoldAttempt::Done(CompileReport {
            wallet: wallet.clone(),
            mapping_version,
            partitions_folded,
            events_applied,
            events_skipped,
            late_events: 0,
            rebuilt,
            errors_recorded,
            reresolve_conditions: reresolve.into_iter().collect(),
        }))
    }
}
