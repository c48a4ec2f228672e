//! Position, watermark and effect persistence, plus the atomic fold commit.

use crate::compile::FoldWatermark;
use crate::domain::{
    Address, ConditionId, EventKey, EventOrderingKey, LedgerError, LedgerErrorKind, OutcomeIndex,
    TimeMs, TxHash,
};
use crate::engine::{Effect, EffectKind, PartitionKey, Position};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use super::{insert_error, parse_decimal, Repository};

/// Everything one wallet fold writes, committed in a single transaction.
pub struct FoldCommit<'a> {
    pub wallet: &'a Address,
    pub positions: &'a [Position],
    pub effects: &'a [Effect],
    pub watermarks: &'a [FoldWatermark],
    pub errors: &'a [LedgerError],
    /// Error kinds whose rows for this wallet are replaced rather than appended.
    pub refreshed_kinds: &'a [LedgerErrorKind],
}

/// Error kinds produced by folding, cleared when a wallet is rebuilt.
const FOLD_ERROR_KINDS: [LedgerErrorKind; 4] = [
    LedgerErrorKind::MappingInconsistent,
    LedgerErrorKind::InventoryShortfall,
    LedgerErrorKind::ResolutionMissing,
    LedgerErrorKind::UnmappedToken,
];

fn partition_from_row(row: &SqliteRow) -> Option<PartitionKey> {
    let outcome = OutcomeIndex::try_from(row.get::<i64, _>("outcome_index")).ok()?;
    Some(PartitionKey::new(
        Address::from_stored(row.get("wallet")),
        ConditionId::from_stored(row.get("condition_id")),
        outcome,
    ))
}

fn position_from_row(row: &SqliteRow) -> Option<Position> {
    let key = partition_from_row(row)?;
    Some(Position {
        key,
        quantity: parse_decimal(&row.get::<String, _>("quantity"), "quantity"),
        cost_basis: parse_decimal(&row.get::<String, _>("cost_basis"), "cost_basis"),
        realized_pnl: parse_decimal(&row.get::<String, _>("realized_pnl"), "realized_pnl"),
        fees_paid: parse_decimal(&row.get::<String, _>("fees_paid"), "fees_paid"),
        cash_flow: parse_decimal(&row.get::<String, _>("cash_flow"), "cash_flow"),
        last_price: row
            .get::<Option<String>, _>("last_price")
            .map(|p| parse_decimal(&p, "last_price")),
        unbacked_redeem_shares: parse_decimal(
            &row.get::<String, _>("unbacked_redeem_shares"),
            "unbacked_redeem_shares",
        ),
        opened_at: row.get::<Option<i64>, _>("opened_at").map(TimeMs::new),
        updated_at: row.get::<Option<i64>, _>("updated_at").map(TimeMs::new),
    })
}

fn effect_from_row(row: &SqliteRow) -> Option<Effect> {
    let partition = partition_from_row(row)?;
    let kind_str: String = row.get("kind");
    let kind = match kind_str.parse::<EffectKind>() {
        Ok(kind) => kind,
        Err(e) => {
            warn!(error = %e, "Skipping stored effect with unknown kind");
            return None;
        }
    };
    Some(Effect {
        event_key: EventKey::new(TxHash::from_stored(row.get("tx_hash")), row.get("log_index")),
        partition,
        kind,
        qty: parse_decimal(&row.get::<String, _>("qty"), "qty"),
        cash_delta: parse_decimal(&row.get::<String, _>("cash_delta"), "cash_delta"),
        realized_delta: parse_decimal(&row.get::<String, _>("realized_delta"), "realized_delta"),
        time_ms: TimeMs::new(row.get("time_ms")),
    })
}

const POSITION_COLUMNS: &str = "wallet, condition_id, outcome_index, quantity, cost_basis, \
     realized_pnl, fees_paid, cash_flow, last_price, unbacked_redeem_shares, opened_at, updated_at";

impl Repository {
    // =========================================================================
    // Positions
    // =========================================================================

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn positions_for_wallet(&self, wallet: &Address) -> Result<Vec<Position>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM positions WHERE wallet = ? ORDER BY condition_id, outcome_index",
            POSITION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(wallet.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(position_from_row).collect())
    }

    /// Every wallet's positions in one condition.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn positions_for_condition(
        &self,
        condition_id: &ConditionId,
    ) -> Result<Vec<Position>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM positions WHERE condition_id = ? ORDER BY wallet, outcome_index",
            POSITION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(condition_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(position_from_row).collect())
    }

    // =========================================================================
    // Watermarks and effects
    // =========================================================================

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn watermarks_for_wallet(
        &self,
        wallet: &Address,
    ) -> Result<Vec<FoldWatermark>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT wallet, condition_id, outcome_index, last_time_ms, last_tx_hash,
                   last_log_index, mapping_version
            FROM fold_watermarks
            WHERE wallet = ?
            "#,
        )
        .bind(wallet.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let partition = partition_from_row(row)?;
                let last_key = EventKey::new(
                    TxHash::from_stored(row.get("last_tx_hash")),
                    row.get("last_log_index"),
                );
                Some(FoldWatermark::new(
                    partition,
                    EventOrderingKey::new(TimeMs::new(row.get("last_time_ms")), &last_key),
                    row.get("mapping_version"),
                ))
            })
            .collect())
    }

    /// Effects of a wallet, optionally bounded by an inclusive time window.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn effects_for_wallet(
        &self,
        wallet: &Address,
        from_ms: Option<TimeMs>,
        to_ms: Option<TimeMs>,
    ) -> Result<Vec<Effect>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT tx_hash, log_index, wallet, condition_id, outcome_index, kind, qty,
                   cash_delta, realized_delta, time_ms
            FROM ledger_effects
            WHERE wallet = ?
              AND (? IS NULL OR time_ms >= ?)
              AND (? IS NULL OR time_ms <= ?)
            ORDER BY time_ms ASC, tx_hash ASC, log_index ASC, condition_id, outcome_index
            "#,
        )
        .bind(wallet.as_str())
        .bind(from_ms.map(|t| t.as_ms()))
        .bind(from_ms.map(|t| t.as_ms()))
        .bind(to_ms.map(|t| t.as_ms()))
        .bind(to_ms.map(|t| t.as_ms()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(effect_from_row).collect())
    }

    /// Event keys already folded into each partition of a wallet.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn applied_keys_for_wallet(
        &self,
        wallet: &Address,
    ) -> Result<HashMap<PartitionKey, HashSet<EventKey>>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT tx_hash, log_index, wallet, condition_id, outcome_index
            FROM ledger_effects
            WHERE wallet = ?
            "#,
        )
        .bind(wallet.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut applied: HashMap<PartitionKey, HashSet<EventKey>> = HashMap::new();
        for row in &rows {
            let Some(partition) = partition_from_row(row) else {
                continue;
            };
            applied.entry(partition).or_default().insert(EventKey::new(
                TxHash::from_stored(row.get("tx_hash")),
                row.get("log_index"),
            ));
        }
        Ok(applied)
    }

    /// Drop a wallet's folded state so the next compile starts from its first event.
    ///
    /// Stored events, snapshots and ingest errors are kept.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn clear_wallet_ledger(&self, wallet: &Address) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for table in ["positions", "fold_watermarks", "ledger_effects"] {
            sqlx::query(&format!("DELETE FROM {} WHERE wallet = ?", table))
                .bind(wallet.as_str())
                .execute(&mut *tx)
                .await?;
        }
        for kind in FOLD_ERROR_KINDS {
            sqlx::query("DELETE FROM ledger_errors WHERE wallet = ? AND kind = ?")
                .bind(wallet.as_str())
                .bind(kind.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Persist a wallet fold atomically. Returns the number of new error rows.
    ///
    /// Either every position, effect, watermark and error lands, or none does, so a crash
    /// mid-commit leaves the previous watermarks pointing at consistent positions.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn commit_fold(&self, commit: &FoldCommit<'_>) -> Result<usize, sqlx::Error> {
        let recorded_at = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for p in commit.positions {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO positions (
                    wallet, condition_id, outcome_index, quantity, cost_basis, realized_pnl,
                    fees_paid, cash_flow, last_price, unbacked_redeem_shares, opened_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(p.key.wallet.as_str())
            .bind(p.key.condition_id.as_str())
            .bind(p.key.outcome_index as i64)
            .bind(p.quantity.to_canonical_string())
            .bind(p.cost_basis.to_canonical_string())
            .bind(p.realized_pnl.to_canonical_string())
            .bind(p.fees_paid.to_canonical_string())
            .bind(p.cash_flow.to_canonical_string())
            .bind(p.last_price.map(|d| d.to_canonical_string()))
            .bind(p.unbacked_redeem_shares.to_canonical_string())
            .bind(p.opened_at.map(|t| t.as_ms()))
            .bind(p.updated_at.map(|t| t.as_ms()))
            .execute(&mut *tx)
            .await?;
        }

        for e in commit.effects {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO ledger_effects (
                    tx_hash, log_index, wallet, condition_id, outcome_index, kind, qty,
                    cash_delta, realized_delta, time_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(e.event_key.tx_hash.as_str())
            .bind(e.event_key.log_index)
            .bind(e.partition.wallet.as_str())
            .bind(e.partition.condition_id.as_str())
            .bind(e.partition.outcome_index as i64)
            .bind(e.kind.as_str())
            .bind(e.qty.to_canonical_string())
            .bind(e.cash_delta.to_canonical_string())
            .bind(e.realized_delta.to_canonical_string())
            .bind(e.time_ms.as_ms())
            .execute(&mut *tx)
            .await?;
        }

        for w in commit.watermarks {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO fold_watermarks (
                    wallet, condition_id, outcome_index, last_time_ms, last_tx_hash,
                    last_log_index, mapping_version
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(w.partition.wallet.as_str())
            .bind(w.partition.condition_id.as_str())
            .bind(w.partition.outcome_index as i64)
            .bind(w.last.time_ms.as_ms())
            .bind(w.last.tx_hash.as_str())
            .bind(w.last.log_index)
            .bind(w.mapping_version)
            .execute(&mut *tx)
            .await?;
        }

        for kind in commit.refreshed_kinds {
            sqlx::query("DELETE FROM ledger_errors WHERE wallet = ? AND kind = ?")
                .bind(commit.wallet.as_str())
                .bind(kind.as_str())
                .execute(&mut *tx)
                .await?;
        }

        let mut inserted = 0usize;
        for error in commit.errors {
            if insert_error(&mut tx, error, recorded_at).await? {
                inserted += 1;
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::init_db;
    use crate::domain::Decimal;
    use tempfile::TempDir;

    async fn setup_test_db() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Repository::new(pool), temp_dir)
    }

    fn key() -> PartitionKey {
        PartitionKey::new(Address::new("0xabc"), ConditionId::new("0xc0"), 1)
    }

    fn effect(tx: &str, time: i64) -> Effect {
        Effect {
            event_key: EventKey::new(TxHash::new(tx), 0),
            partition: key(),
            kind: EffectKind::Buy,
            qty: Decimal::from_i64(10),
            cash_delta: Decimal::from_i64(-4),
            realized_delta: Decimal::zero(),
            time_ms: TimeMs::new(time),
        }
    }

    #[tokio::test]
    async fn test_commit_fold_round_trip() {
        let (repo, _temp) = setup_test_db().await;
        let wallet = Address::new("0xabc");

        let mut position = Position::new(key());
        position.quantity = Decimal::from_i64(10);
        position.cost_basis = Decimal::from_str_canonical("0.4").unwrap();
        position.cash_flow = Decimal::from_i64(-4);
        position.last_price = Some(Decimal::from_str_canonical("0.4").unwrap());
        position.opened_at = Some(TimeMs::new(100));
        position.updated_at = Some(TimeMs::new(200));

        let effects = vec![effect("0x01", 100), effect("0x02", 200)];
        let watermark = FoldWatermark::new(
            key(),
            EventOrderingKey::new(TimeMs::new(200), &effects[1].event_key),
            3,
        );
        let errors = vec![LedgerError::new(LedgerErrorKind::UnmappedToken, "token 9")
            .with_wallet(&wallet)];

        let inserted = repo
            .commit_fold(&FoldCommit {
                wallet: &wallet,
                positions: &[position.clone()],
                effects: &effects,
                watermarks: &[watermark.clone()],
                errors: &errors,
                refreshed_kinds: &[LedgerErrorKind::UnmappedToken],
            })
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        assert_eq!(repo.positions_for_wallet(&wallet).await.unwrap(), vec![position]);
        assert_eq!(repo.watermarks_for_wallet(&wallet).await.unwrap(), vec![watermark]);
        assert_eq!(repo.effects_for_wallet(&wallet, None, None).await.unwrap(), effects);

        let windowed = repo
            .effects_for_wallet(&wallet, Some(TimeMs::new(150)), None)
            .await
            .unwrap();
        assert_eq!(windowed.len(), 1);

        let applied = repo.applied_keys_for_wallet(&wallet).await.unwrap();
        assert_eq!(applied.get(&key()).map(|s| s.len()), Some(2));
    }

    #[tokio::test]
    async fn test_refreshed_kinds_replace_previous_rows() {
        let (repo, _temp) = setup_test_db().await;
        let wallet = Address::new("0xabc");
        let stale = vec![LedgerError::new(LedgerErrorKind::UnmappedToken, "token 9")
            .with_wallet(&wallet)];

        let none: Vec<LedgerError> = Vec::new();

        for errors in [&stale, &none] {
            repo.commit_fold(&FoldCommit {
                wallet: &wallet,
                positions: &[],
                effects: &[],
                watermarks: &[],
                errors,
                refreshed_kinds: &[LedgerErrorKind::UnmappedToken],
            })
            .await
            .unwrap();
        }

        let remaining = repo.query_errors(Some(&wallet), None).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_clear_wallet_ledger_keeps_other_wallets() {
        let (repo, _temp) = setup_test_db().await;
        let wallet = Address::new("0xabc");
        let other = Address::new("0xdef");
        let mut other_position = Position::new(PartitionKey::new(
            other.clone(),
            ConditionId::new("0xc0"),
            0,
        ));
        other_position.quantity = Decimal::one();

        repo.commit_fold(&FoldCommit {
            wallet: &wallet,
            positions: &[Position::new(key())],
            effects: &[effect("0x01", 1)],
            watermarks: &[],
            errors: &[],
            refreshed_kinds: &[],
        })
        .await
        .unwrap();
        repo.commit_fold(&FoldCommit {
            wallet: &other,
            positions: &[other_position],
            effects: &[],
            watermarks: &[],
            errors: &[],
            refreshed_kinds: &[],
        })
        .await
        .unwrap();

        repo.clear_wallet_ledger(&wallet).await.unwrap();

        assert!(repo.positions_for_wallet(&wallet).await.unwrap().is_empty());
        assert!(repo.effects_for_wallet(&wallet, None, None).await.unwrap().is_empty());
        assert_eq!(
            repo.positions_for_condition(&ConditionId::new("0xc0"))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
