//! Mapping snapshot and calibration run persistence.

use crate::domain::{
    Address, ConditionId, Decimal, MappingSnapshot, MappingSource, MappingStatus, OutcomeIndex,
    TokenId, TokenOutcomeMapping,
};
use serde::Serialize;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::{parse_decimal, Repository};

/// One stored calibration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRunRecord {
    pub run_id: String,
    pub condition_id: ConditionId,
    pub wallet: Address,
    /// Snapshot version the run's mappings were frozen into.
    pub snapshot_version: i64,
    pub ground_truth: Decimal,
    pub computed_pnl: Decimal,
    pub error: Decimal,
    pub iterations: i64,
    pub confidence: Decimal,
    pub converged: bool,
    pub created_at: i64,
}

impl Repository {
    /// The newest snapshot, or the empty version-0 snapshot when none is stored.
    ///
    /// # Errors
    /// Returns an error if a query fails.
    pub async fn current_snapshot(&self) -> Result<MappingSnapshot, sqlx::Error> {
        let latest: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM mapping_snapshots")
            .fetch_one(&self.pool)
            .await?;
        match latest {
            Some(version) => Ok(self
                .snapshot(version)
                .await?
                .unwrap_or_else(MappingSnapshot::empty)),
            None => Ok(MappingSnapshot::empty()),
        }
    }

    /// Load one snapshot version.
    ///
    /// # Errors
    /// Returns an error if a query fails.
    pub async fn snapshot(&self, version: i64) -> Result<Option<MappingSnapshot>, sqlx::Error> {
        let header = sqlx::query("SELECT fingerprint FROM mapping_snapshots WHERE version = ?")
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;
        let Some(header) = header else {
            return Ok(None);
        };

        let rows = sqlx::query(
            r#"
            SELECT token_id, condition_id, outcome_index, source, confidence, status
            FROM token_mappings
            WHERE version = ?
            "#,
        )
        .bind(version)
        .fetch_all(&self.pool)
        .await?;

        let mut mappings = BTreeMap::new();
        for row in rows {
            let token_id = TokenId::new(row.get::<String, _>("token_id"));
            let source = row.get::<String, _>("source").parse::<MappingSource>();
            let status = row.get::<String, _>("status").parse::<MappingStatus>();
            let outcome = OutcomeIndex::try_from(row.get::<i64, _>("outcome_index"));
            let (Ok(source), Ok(status), Ok(outcome_index)) = (source, status, outcome) else {
                warn!(version, token = %token_id, "Skipping malformed token mapping row");
                continue;
            };
            mappings.insert(
                token_id.clone(),
                TokenOutcomeMapping {
                    token_id,
                    condition_id: ConditionId::from_stored(row.get("condition_id")),
                    outcome_index,
                    source,
                    confidence: parse_decimal(&row.get::<String, _>("confidence"), "confidence"),
                    status,
                },
            );
        }

        let snapshot = MappingSnapshot::new(version, mappings);
        let stored: String = header.get("fingerprint");
        if snapshot.fingerprint != stored {
            warn!(
                version,
                stored = %stored,
                computed = %snapshot.fingerprint,
                "Mapping snapshot fingerprint mismatch"
            );
        }
        Ok(Some(snapshot))
    }

    /// Next unused snapshot version (1 for an empty store).
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn next_snapshot_version(&self) -> Result<i64, sqlx::Error> {
        let latest: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM mapping_snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(latest.unwrap_or(0) + 1)
    }

    /// Persist a new snapshot. Snapshots are immutable: storing an existing version fails.
    ///
    /// # Errors
    /// Returns an error if the transaction fails, including on a duplicate version.
    pub async fn store_snapshot(&self, snapshot: &MappingSnapshot) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO mapping_snapshots (version, fingerprint, created_at) VALUES (?, ?, ?)",
        )
        .bind(snapshot.version)
        .bind(&snapshot.fingerprint)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for mapping in snapshot.iter() {
            sqlx::query(
                r#"
                INSERT INTO token_mappings
                (version, token_id, condition_id, outcome_index, source, confidence, status)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(snapshot.version)
            .bind(mapping.token_id.as_str())
            .bind(mapping.condition_id.as_str())
            .bind(mapping.outcome_index as i64)
            .bind(mapping.source.as_str())
            .bind(mapping.confidence.to_canonical_string())
            .bind(mapping.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            version = snapshot.version,
            mappings = snapshot.len(),
            fingerprint = %snapshot.fingerprint,
            "Stored mapping snapshot"
        );
        Ok(())
    }

    // =========================================================================
    // Calibration runs
    // =========================================================================

    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn insert_calibration_run(
        &self,
        run: &CalibrationRunRecord,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO calibration_runs (
                run_id, condition_id, wallet, snapshot_version, ground_truth, computed_pnl,
                error, iterations, confidence, converged, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(run.condition_id.as_str())
        .bind(run.wallet.as_str())
        .bind(run.snapshot_version)
        .bind(run.ground_truth.to_canonical_string())
        .bind(run.computed_pnl.to_canonical_string())
        .bind(run.error.to_canonical_string())
        .bind(run.iterations)
        .bind(run.confidence.to_canonical_string())
        .bind(run.converged)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Calibration runs for a condition, newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn calibration_runs(
        &self,
        condition_id: &ConditionId,
    ) -> Result<Vec<CalibrationRunRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, condition_id, wallet, snapshot_version, ground_truth, computed_pnl,
                   error, iterations, confidence, converged, created_at
            FROM calibration_runs
            WHERE condition_id = ?
            ORDER BY created_at DESC, run_id ASC
            "#,
        )
        .bind(condition_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CalibrationRunRecord {
                run_id: row.get("run_id"),
                condition_id: ConditionId::from_stored(row.get("condition_id")),
                wallet: Address::from_stored(row.get("wallet")),
                snapshot_version: row.get("snapshot_version"),
                ground_truth: parse_decimal(&row.get::<String, _>("ground_truth"), "ground_truth"),
                computed_pnl: parse_decimal(&row.get::<String, _>("computed_pnl"), "computed_pnl"),
                error: parse_decimal(&row.get::<String, _>("error"), "error"),
                iterations: row.get("iterations"),
                confidence: parse_decimal(&row.get::<String, _>("confidence"), "confidence"),
                converged: row.get("converged"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
