//! Derivation of new mapping snapshots: condition metadata, transaction correlation and
//! per-condition calibration.

use crate::db::{CalibrationRunRecord, Repository};
use crate::domain::{
    Address, ConditionId, Decimal, LedgerError, LedgerErrorKind, MappingSnapshot,
    SettlementPolicy,
};
use crate::engine::{
    calibrate, settle_all, AmbiguousCondition, CalibrationConfig, CalibrationOutcome,
    CalibrationProblem, GroundTruth, MappingBuilder,
};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::PipelineError;

/// Result of re-deriving the mapping snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRefresh {
    /// Version in effect after the refresh.
    pub version: i64,
    /// True when a new snapshot was stored.
    pub changed: bool,
    /// Conditions that still need calibration.
    pub ambiguous: Vec<AmbiguousCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationReport {
    pub run_id: String,
    pub snapshot_version: i64,
    pub outcome: CalibrationOutcome,
}

async fn builder_from_store(
    repo: &Repository,
) -> Result<(MappingSnapshot, MappingBuilder), sqlx::Error> {
    let current = repo.current_snapshot().await?;
    let mut builder = MappingBuilder::from_snapshot(&current);
    for meta in repo.condition_metas().await? {
        builder.add_condition_meta(&meta);
    }
    Ok((current, builder))
}

/// Store `builder` as the next snapshot unless its rows match `current`.
async fn freeze_if_changed(
    repo: &Repository,
    current: &MappingSnapshot,
    builder: MappingBuilder,
) -> Result<(i64, bool), sqlx::Error> {
    let candidate = builder.freeze(repo.next_snapshot_version().await?);
    if candidate.fingerprint == current.fingerprint {
        return Ok((current.version, false));
    }
    repo.store_snapshot(&candidate).await?;
    Ok((candidate.version, true))
}

/// Rebuild the snapshot from condition metadata and transaction correlation.
///
/// A new version is stored only when the derived rows differ from the current snapshot, so
/// repeated refreshes never force wallet rebuilds on their own.
pub async fn refresh_mappings(repo: &Repository) -> Result<MappingRefresh, PipelineError> {
    let (current, mut builder) = builder_from_store(repo).await?;

    let trades = repo.trades_in_settlement_transactions().await?;
    let settlements = repo.split_merge_settlements().await?;
    let ambiguous = builder.correlate_transactions(&trades, &settlements);

    let (version, changed) = freeze_if_changed(repo, &current, builder).await?;
    info!(
        version,
        changed,
        ambiguous = ambiguous.len(),
        "Refreshed token mappings"
    );
    Ok(MappingRefresh {
        version,
        changed,
        ambiguous,
    })
}

/// Calibrate an ambiguous condition against one wallet's ground-truth P&L.
///
/// The wallet must already be compiled: its positions outside the condition form the
/// baseline. Returns `None` when every token already has a production mapping. A result
/// outside tolerance is still stored, as low-confidence mappings, and logged as
/// `CalibrationDivergence`.
pub async fn calibrate_condition(
    repo: &Repository,
    config: &CalibrationConfig,
    condition: &AmbiguousCondition,
    wallet: &Address,
    ground_truth: GroundTruth,
) -> Result<Option<CalibrationReport>, PipelineError> {
    let (current, mut builder) = builder_from_store(repo).await?;
    if condition
        .tokens
        .iter()
        .all(|t| builder.has_production_mapping(t))
    {
        info!(condition = %condition.condition_id, "Condition already mapped, skipping calibration");
        return Ok(None);
    }

    let problem = build_problem(repo, &current, &builder, condition, wallet, ground_truth).await?;
    let outcome = calibrate(&problem, config);

    builder.insert_calibrated(outcome.mappings.iter().cloned());
    let (snapshot_version, _) = freeze_if_changed(repo, &current, builder).await?;

    let run = CalibrationRunRecord {
        run_id: uuid::Uuid::new_v4().to_string(),
        condition_id: condition.condition_id.clone(),
        wallet: wallet.clone(),
        snapshot_version,
        ground_truth: problem.ground_truth.total_pnl,
        computed_pnl: outcome.computed_pnl,
        error: outcome.error,
        iterations: outcome.iterations as i64,
        confidence: outcome.confidence,
        converged: outcome.converged,
        created_at: chrono::Utc::now().timestamp_millis(),
    };
    repo.insert_calibration_run(&run).await?;

    if !outcome.converged {
        warn!(
            condition = %condition.condition_id,
            wallet = %wallet,
            error = %outcome.error,
            "Calibration did not converge"
        );
        let divergence = LedgerError::new(
            LedgerErrorKind::CalibrationDivergence,
            format!(
                "error {} against ground truth {} after {} iterations",
                outcome.error, run.ground_truth, outcome.iterations
            ),
        )
        .with_wallet(wallet)
        .with_condition(&condition.condition_id);
        repo.record_errors(&[divergence]).await?;
    }

    Ok(Some(CalibrationReport {
        run_id: run.run_id,
        snapshot_version,
        outcome,
    }))
}

async fn build_problem(
    repo: &Repository,
    snapshot: &MappingSnapshot,
    builder: &MappingBuilder,
    condition: &AmbiguousCondition,
    wallet: &Address,
    ground_truth: GroundTruth,
) -> Result<CalibrationProblem, sqlx::Error> {
    let condition_id: &ConditionId = &condition.condition_id;
    let tokens: Vec<_> = condition
        .tokens
        .iter()
        .filter(|t| !builder.has_production_mapping(t))
        .cloned()
        .collect();
    let token_set: BTreeSet<_> = tokens.iter().collect();

    let trades = repo
        .trades_for_wallet(wallet)
        .await?
        .into_iter()
        .filter_map(|t| {
            if token_set.contains(&t.token_id) {
                return Some(t);
            }
            match snapshot.resolve(&t.token_id) {
                Some(m) if &m.condition_id == condition_id => {
                    Some(t.with_outcome(m.condition_id.clone(), m.outcome_index))
                }
                _ => None,
            }
        })
        .collect();
    let settlements = repo
        .settlements_for_wallet(wallet)
        .await?
        .into_iter()
        .filter(|s| &s.condition_id == condition_id)
        .collect();
    let resolutions = repo.resolutions().await?;

    let outside: Vec<_> = repo
        .positions_for_wallet(wallet)
        .await?
        .into_iter()
        .filter(|p| p.condition_id() != condition_id)
        .collect();
    let (settled, _) = settle_all(&outside, &resolutions, SettlementPolicy::Symmetric);
    let baseline: Decimal = settled.iter().map(|s| s.total_pnl()).sum();

    Ok(CalibrationProblem {
        wallet: wallet.clone(),
        condition_id: condition_id.clone(),
        outcome_count: builder.outcome_count(condition_id),
        candidate_outcomes: builder.free_outcomes(condition_id),
        tokens,
        trades,
        settlements,
        resolution: resolutions.get(condition_id).cloned(),
        baseline,
        ground_truth,
    })
}
