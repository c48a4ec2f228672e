//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `events.rs` - Trade/settlement events and reference data (resolutions, conditions, proxies)
//! - `mappings.rs` - Mapping snapshots and calibration runs
//! - `positions.rs` - Positions, watermarks, effects and the atomic fold commit
//!
//! The structured error log lives here because every layer writes to it.

mod events;
mod mappings;
mod positions;

pub use events::EventUpsert;
pub use mappings::CalibrationRunRecord;
pub use positions::FoldCommit;

use crate::domain::{
    Address, ConditionId, Decimal, EventKey, LedgerError, LedgerErrorKind, TokenId, TxHash,
};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use std::str::FromStr;
use tracing::warn;

/// Repository for database operations.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

/// Parse a stored canonical decimal, falling back to zero on corrupt data.
pub(super) fn parse_decimal(raw: &str, field: &'static str) -> Decimal {
    Decimal::from_str(raw).unwrap_or_else(|e| {
        warn!(field, value = %raw, error = %e, "Failed to parse stored decimal, using zero");
        Decimal::zero()
    })
}

/// Parse an event key stored as `tx_hash:log_index`.
pub(super) fn parse_event_key(raw: &str) -> Option<EventKey> {
    let (tx, log) = raw.rsplit_once(':')?;
    let log_index = log.parse::<i64>().ok()?;
    Some(EventKey::new(TxHash::from_stored(tx.to_string()), log_index))
}

/// Insert one error row, ignoring exact duplicates.
pub(super) async fn insert_error(
    conn: &mut SqliteConnection,
    error: &LedgerError,
    recorded_at: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO ledger_errors
        (kind, wallet, condition_id, outcome_index, token_id, event_key, detail, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(error.kind.as_str())
    .bind(error.wallet.as_ref().map(|w| w.as_str()).unwrap_or(""))
    .bind(error.condition_id.as_ref().map(|c| c.as_str()).unwrap_or(""))
    .bind(error.outcome_index.map(|o| o as i64).unwrap_or(-1))
    .bind(error.token_id.as_ref().map(|t| t.as_str()).unwrap_or(""))
    .bind(error.event_key.as_ref().map(|k| k.to_string()).unwrap_or_default())
    .bind(&error.detail)
    .bind(recorded_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trip a trivial query; used by the readiness check.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // =========================================================================
    // Ledger error log
    // =========================================================================

    /// Persist ledger errors. Returns the number of new rows.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn record_errors(&self, errors: &[LedgerError]) -> Result<usize, sqlx::Error> {
        if errors.is_empty() {
            return Ok(0);
        }

        let recorded_at = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for error in errors {
            if insert_error(&mut tx, error, recorded_at).await? {
                inserted += 1;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Query the error log, optionally filtered by wallet and kind.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_errors(
        &self,
        wallet: Option<&Address>,
        kind: Option<LedgerErrorKind>,
    ) -> Result<Vec<LedgerError>, sqlx::Error> {
        let wallet = wallet.map(|w| w.as_str().to_string());
        let kind = kind.map(|k| k.as_str());

        let rows = sqlx::query(
            r#"
            SELECT kind, wallet, condition_id, outcome_index, token_id, event_key, detail
            FROM ledger_errors
            WHERE (? IS NULL OR wallet = ?) AND (? IS NULL OR kind = ?)
            ORDER BY id ASC
            "#,
        )
        .bind(wallet.as_deref())
        .bind(wallet.as_deref())
        .bind(kind)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        let mut errors = Vec::with_capacity(rows.len());
        for row in rows {
            let kind_str: String = row.get("kind");
            let Ok(kind) = kind_str.parse::<LedgerErrorKind>() else {
                warn!(kind = %kind_str, "Skipping ledger error row with unknown kind");
                continue;
            };
            let wallet: String = row.get("wallet");
            let condition_id: String = row.get("condition_id");
            let outcome_index: i64 = row.get("outcome_index");
            let token_id: String = row.get("token_id");
            let event_key: String = row.get("event_key");

            errors.push(LedgerError {
                kind,
                wallet: (!wallet.is_empty()).then(|| Address::from_stored(wallet)),
                condition_id: (!condition_id.is_empty())
                    .then(|| ConditionId::from_stored(condition_id)),
                outcome_index: u32::try_from(outcome_index).ok(),
                token_id: (!token_id.is_empty()).then(|| TokenId::new(token_id)),
                event_key: parse_event_key(&event_key),
                detail: row.get("detail"),
            });
        }
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::init_db;
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

    #[tokio::test]
    async fn test_record_and_query_errors() {
        let (repo, _temp) = setup_test_db().await;
        let wallet = Address::new("0xabc");

        let errors = vec![
            LedgerError::new(LedgerErrorKind::UnmappedToken, "no mapping")
                .with_wallet(&wallet)
                .with_token(&TokenId::new("77")),
            LedgerError::new(LedgerErrorKind::MappingInconsistent, "unbacked redeem")
                .with_wallet(&wallet)
                .with_condition(&ConditionId::new("0xc0"))
                .with_outcome(0)
                .with_event(&EventKey::new(TxHash::new("0x9"), 3)),
            LedgerError::new(LedgerErrorKind::MalformedEvent, "bad row"),
        ];
        assert_eq!(repo.record_errors(&errors).await.unwrap(), 3);
        // exact duplicates are ignored
        assert_eq!(repo.record_errors(&errors).await.unwrap(), 0);

        let for_wallet = repo.query_errors(Some(&wallet), None).await.unwrap();
        assert_eq!(for_wallet.len(), 2);

        let inconsistent = repo
            .query_errors(Some(&wallet), Some(LedgerErrorKind::MappingInconsistent))
            .await
            .unwrap();
        assert_eq!(inconsistent.len(), 1);
        assert_eq!(inconsistent[0], errors[1]);

        let all = repo.query_errors(None, None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_parse_event_key() {
        let key = parse_event_key("0xab:12").unwrap();
        assert_eq!(key, EventKey::new(TxHash::new("0xab"), 12));
        assert!(parse_event_key("").is_none());
        assert!(parse_event_key("0xab:x").is_none());
    }
}
