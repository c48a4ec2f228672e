//! Event and reference-data operations for the repository.

use crate::domain::{
    Address, ConditionId, ConditionMeta, EventKey, MarketResolution, OutcomeIndex,
    SettlementEvent, SettlementKind, Side, TimeMs, TokenId, TradeEvent, TxHash,
};
use crate::compile::FoldWatermark;
use crate::engine::ProxyMap;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};

use super::{parse_decimal, Repository};

fn trade_from_row(row: &SqliteRow) -> Option<TradeEvent> {
    let tx_hash: String = row.get("tx_hash");
    let side_str: String = row.get("side");
    let side = match side_str.parse::<Side>() {
        Ok(side) => side,
        Err(e) => {
            warn!(tx_hash = %tx_hash, error = %e, "Skipping stored trade with invalid side");
            return None;
        }
    };
    Some(TradeEvent {
        key: EventKey::new(TxHash::from_stored(tx_hash), row.get("log_index")),
        wallet: Address::from_stored(row.get("wallet")),
        token_id: TokenId::new(row.get::<String, _>("token_id")),
        condition_id: None,
        outcome_index: None,
        side,
        shares: parse_decimal(&row.get::<String, _>("shares"), "shares"),
        price: parse_decimal(&row.get::<String, _>("price"), "price"),
        fee: parse_decimal(&row.get::<String, _>("fee"), "fee"),
        time_ms: TimeMs::new(row.get("time_ms")),
    })
}

fn settlement_from_row(row: &SqliteRow) -> Option<SettlementEvent> {
    let tx_hash: String = row.get("tx_hash");
    let kind_str: String = row.get("kind");
    let kind = match kind_str.parse::<SettlementKind>() {
        Ok(kind) => kind,
        Err(e) => {
            warn!(tx_hash = %tx_hash, error = %e, "Skipping stored settlement with invalid kind");
            return None;
        }
    };
    Some(SettlementEvent {
        key: EventKey::new(TxHash::from_stored(tx_hash), row.get("log_index")),
        wallet: Address::from_stored(row.get("wallet")),
        condition_id: ConditionId::from_stored(row.get("condition_id")),
        outcome_index: row
            .get::<Option<i64>, _>("outcome_index")
            .and_then(|o| OutcomeIndex::try_from(o).ok()),
        kind,
        shares: parse_decimal(&row.get::<String, _>("shares"), "shares"),
        usdc_delta: parse_decimal(&row.get::<String, _>("usdc_delta"), "usdc_delta"),
        time_ms: TimeMs::new(row.get("time_ms")),
    })
}

const TRADE_COLUMNS: &str =
    "tx_hash, log_index, wallet, token_id, side, shares, price, fee, time_ms";
const SETTLEMENT_COLUMNS: &str =
    "tx_hash, log_index, wallet, condition_id, outcome_index, kind, shares, usdc_delta, time_ms";

/// Outcome of writing a batch of events keyed by `(tx_hash, log_index)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventUpsert {
    /// Keys seen for the first time.
    pub inserted: usize,
    /// Stored rows replaced by a record with a later `written_at`.
    pub superseded: usize,
}

/// Stored `(wallet, written_at)` for an event key, if the key is known.
async fn stored_write(
    conn: &mut SqliteConnection,
    table: &str,
    key: &EventKey,
) -> Result<Option<(String, i64)>, sqlx::Error> {
    let sql = format!(
        "SELECT wallet, written_at FROM {} WHERE tx_hash = ? AND log_index = ?",
        table
    );
    let row = sqlx::query(&sql)
        .bind(key.tx_hash.as_str())
        .bind(key.log_index)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| (r.get("wallet"), r.get("written_at"))))
}

/// Mark every watermark of `wallets` stale so their next compile refolds from scratch.
async fn invalidate_watermarks(
    conn: &mut SqliteConnection,
    wallets: &BTreeSet<Address>,
) -> Result<(), sqlx::Error> {
    for wallet in wallets {
        sqlx::query("UPDATE fold_watermarks SET mapping_version = ? WHERE wallet = ?")
            .bind(FoldWatermark::INVALIDATED)
            .bind(wallet.as_str())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

impl Repository {
    // =========================================================================
    // Trade and settlement events
    // =========================================================================

    /// Write trades keyed by `(tx_hash, log_index)`, keeping the latest write of each key.
    ///
    /// A record replaces the stored row only when its `written_at` is strictly later, so
    /// replaying a feed changes nothing. Wallets touched by a replaced row have their
    /// watermarks invalidated in the same transaction. Keys missing from `written_at` are
    /// stamped with the event time.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn upsert_trades(
        &self,
        trades: &[TradeEvent],
        written_at: &HashMap<EventKey, i64>,
    ) -> Result<EventUpsert, sqlx::Error> {
        let mut outcome = EventUpsert::default();
        if trades.is_empty() {
            return Ok(outcome);
        }

        let ingested_at = chrono::Utc::now().timestamp_millis();
        let mut rewritten = BTreeSet::new();
        let mut tx = self.pool.begin().await?;

        for trade in trades {
            let written = written_at
                .get(&trade.key)
                .copied()
                .unwrap_or_else(|| trade.time_ms.as_ms());
            let sql = match stored_write(&mut *tx, "trade_events", &trade.key).await? {
                None => {
                    outcome.inserted += 1;
                    r#"
                    INSERT INTO trade_events (
                        wallet, token_id, side, shares, price, fee, time_ms, written_at,
                        ingested_at, tx_hash, log_index
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#
                }
                Some((_, stored)) if stored >= written => continue,
                Some((previous_wallet, _)) => {
                    outcome.superseded += 1;
                    rewritten.insert(Address::from_stored(previous_wallet));
                    rewritten.insert(trade.wallet.clone());
                    r#"
                    UPDATE trade_events SET
                        wallet = ?, token_id = ?, side = ?, shares = ?, price = ?, fee = ?,
                        time_ms = ?, written_at = ?, ingested_at = ?
                    WHERE tx_hash = ? AND log_index = ?
                    "#
                }
            };

            sqlx::query(sql)
                .bind(trade.wallet.as_str())
                .bind(trade.token_id.as_str())
                .bind(trade.side.to_string())
                .bind(trade.shares.to_canonical_string())
                .bind(trade.price.to_canonical_string())
                .bind(trade.fee.to_canonical_string())
                .bind(trade.time_ms.as_ms())
                .bind(written)
                .bind(ingested_at)
                .bind(trade.key.tx_hash.as_str())
                .bind(trade.key.log_index)
                .execute(&mut *tx)
                .await?;
        }

        invalidate_watermarks(&mut *tx, &rewritten).await?;
        tx.commit().await?;
        if !rewritten.is_empty() {
            info!(
                superseded = outcome.superseded,
                wallets = rewritten.len(),
                "Trades rewritten by later records, wallets marked for rebuild"
            );
        }
        Ok(outcome)
    }

    /// Write settlement events with the same latest-write rule as [`Repository::upsert_trades`].
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn upsert_settlements(
        &self,
        events: &[SettlementEvent],
        written_at: &HashMap<EventKey, i64>,
    ) -> Result<EventUpsert, sqlx::Error> {
        let mut outcome = EventUpsert::default();
        if events.is_empty() {
            return Ok(outcome);
        }

        let ingested_at = chrono::Utc::now().timestamp_millis();
        let mut rewritten = BTreeSet::new();
        let mut tx = self.pool.begin().await?;

        for event in events {
            let written = written_at
                .get(&event.key)
                .copied()
                .unwrap_or_else(|| event.time_ms.as_ms());
            let sql = match stored_write(&mut *tx, "settlement_events", &event.key).await? {
                None => {
                    outcome.inserted += 1;
                    r#"
                    INSERT INTO settlement_events (
                        wallet, condition_id, outcome_index, kind, shares, usdc_delta, time_ms,
                        written_at, ingested_at, tx_hash, log_index
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#
                }
                Some((_, stored)) if stored >= written => continue,
                Some((previous_wallet, _)) => {
                    outcome.superseded += 1;
                    rewritten.insert(Address::from_stored(previous_wallet));
                    rewritten.insert(event.wallet.clone());
                    r#"
                    UPDATE settlement_events SET
                        wallet = ?, condition_id = ?, outcome_index = ?, kind = ?, shares = ?,
                        usdc_delta = ?, time_ms = ?, written_at = ?, ingested_at = ?
                    WHERE tx_hash = ? AND log_index = ?
                    "#
                }
            };

            sqlx::query(sql)
                .bind(event.wallet.as_str())
                .bind(event.condition_id.as_str())
                .bind(event.outcome_index.map(|o| o as i64))
                .bind(event.kind.as_str())
                .bind(event.shares.to_canonical_string())
                .bind(event.usdc_delta.to_canonical_string())
                .bind(event.time_ms.as_ms())
                .bind(written)
                .bind(ingested_at)
                .bind(event.key.tx_hash.as_str())
                .bind(event.key.log_index)
                .execute(&mut *tx)
                .await?;
        }

        invalidate_watermarks(&mut *tx, &rewritten).await?;
        tx.commit().await?;
        if !rewritten.is_empty() {
            info!(
                superseded = outcome.superseded,
                wallets = rewritten.len(),
                "Settlements rewritten by later records, wallets marked for rebuild"
            );
        }
        Ok(outcome)
    }

    /// All trades of a wallet in ordering-key order.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn trades_for_wallet(&self, wallet: &Address) -> Result<Vec<TradeEvent>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM trade_events WHERE wallet = ? \
             ORDER BY time_ms ASC, tx_hash ASC, log_index ASC",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(wallet.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(trade_from_row).collect())
    }

    /// All settlements of a wallet in ordering-key order.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn settlements_for_wallet(
        &self,
        wallet: &Address,
    ) -> Result<Vec<SettlementEvent>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM settlement_events WHERE wallet = ? \
             ORDER BY time_ms ASC, tx_hash ASC, log_index ASC",
            SETTLEMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(wallet.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(settlement_from_row).collect())
    }

    /// Trades sharing a transaction with a split or merge, for transaction correlation.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn trades_in_settlement_transactions(&self) -> Result<Vec<TradeEvent>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT t.tx_hash, t.log_index, t.wallet, t.token_id, t.side, t.shares, t.price,
                   t.fee, t.time_ms
            FROM trade_events t
            WHERE EXISTS (
                SELECT 1 FROM settlement_events s
                WHERE s.tx_hash = t.tx_hash AND s.kind IN ('split', 'merge')
            )
            ORDER BY t.time_ms ASC, t.tx_hash ASC, t.log_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(trade_from_row).collect())
    }

    /// Every split and merge event.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn split_merge_settlements(&self) -> Result<Vec<SettlementEvent>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM settlement_events WHERE kind IN ('split', 'merge') \
             ORDER BY time_ms ASC, tx_hash ASC, log_index ASC",
            SETTLEMENT_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().filter_map(settlement_from_row).collect())
    }

    /// Trades on the given token, across wallets.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn trades_for_token(&self, token_id: &TokenId) -> Result<Vec<TradeEvent>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM trade_events WHERE token_id = ? \
             ORDER BY time_ms ASC, tx_hash ASC, log_index ASC",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(token_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(trade_from_row).collect())
    }

    /// Every wallet with at least one stored event.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn wallets(&self) -> Result<Vec<Address>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT wallet FROM trade_events
            UNION
            SELECT wallet FROM settlement_events
            ORDER BY wallet ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Address::from_stored(row.get("wallet")))
            .collect())
    }

    /// Wallets with events touching a condition, directly or through one of its tokens.
    ///
    /// # Errors
    /// Returns an error if a query fails.
    pub async fn wallets_for_condition(
        &self,
        condition_id: &ConditionId,
        tokens: &[TokenId],
    ) -> Result<Vec<Address>, sqlx::Error> {
        let mut wallets = BTreeSet::new();

        let rows = sqlx::query("SELECT DISTINCT wallet FROM settlement_events WHERE condition_id = ?")
            .bind(condition_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            wallets.insert(Address::from_stored(row.get("wallet")));
        }

        for token in tokens {
            let rows = sqlx::query("SELECT DISTINCT wallet FROM trade_events WHERE token_id = ?")
                .bind(token.as_str())
                .fetch_all(&self.pool)
                .await?;
            for row in rows {
                wallets.insert(Address::from_stored(row.get("wallet")));
            }
        }

        Ok(wallets.into_iter().collect())
    }

    // =========================================================================
    // Market resolutions
    // =========================================================================

    /// Insert or replace a market resolution. The caller validates it first.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn upsert_resolution(&self, resolution: &MarketResolution) -> Result<(), sqlx::Error> {
        let numerators = serde_json::to_string(&resolution.payout_numerators)
            .unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO market_resolutions
            (condition_id, winning_outcome_index, payout_numerators, payout_denominator, resolved_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(resolution.condition_id.as_str())
        .bind(resolution.winning_outcome_index as i64)
        .bind(numerators)
        .bind(resolution.payout_denominator as i64)
        .bind(resolution.resolved_at.as_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every stored resolution, keyed by condition. Rows failing validation are skipped.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn resolutions(&self) -> Result<HashMap<ConditionId, MarketResolution>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT condition_id, winning_outcome_index, payout_numerators, payout_denominator,
                   resolved_at
            FROM market_resolutions
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut resolutions = HashMap::with_capacity(rows.len());
        for row in rows {
            let condition_id = ConditionId::from_stored(row.get("condition_id"));
            let numerators_json: String = row.get("payout_numerators");
            let numerators: Vec<u64> = match serde_json::from_str(&numerators_json) {
                Ok(n) => n,
                Err(e) => {
                    warn!(condition = %condition_id, error = %e, "Skipping resolution with bad payout vector");
                    continue;
                }
            };
            let winner = OutcomeIndex::try_from(row.get::<i64, _>("winning_outcome_index"))
                .unwrap_or(OutcomeIndex::MAX);
            let denominator = u64::try_from(row.get::<i64, _>("payout_denominator")).unwrap_or(0);

            match MarketResolution::new(
                condition_id.clone(),
                winner,
                numerators,
                denominator,
                TimeMs::new(row.get("resolved_at")),
            ) {
                Ok(resolution) => {
                    resolutions.insert(condition_id, resolution);
                }
                Err(e) => {
                    warn!(condition = %condition_id, error = %e, "Skipping invalid stored resolution");
                }
            }
        }
        Ok(resolutions)
    }

    // =========================================================================
    // Condition metadata and proxy wallets
    // =========================================================================

    /// Insert or replace condition metadata.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn upsert_condition_meta(&self, meta: &ConditionMeta) -> Result<(), sqlx::Error> {
        let tokens: Vec<&str> = meta.token_ids.iter().map(|t| t.as_str()).collect();
        let tokens_json = serde_json::to_string(&tokens).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO condition_meta (condition_id, outcome_count, token_ids)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(meta.condition_id.as_str())
        .bind(meta.outcome_count as i64)
        .bind(tokens_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn condition_metas(&self) -> Result<Vec<ConditionMeta>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT condition_id, outcome_count, token_ids FROM condition_meta ORDER BY condition_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let condition_id = ConditionId::from_stored(row.get("condition_id"));
                let tokens_json: String = row.get("token_ids");
                let tokens: Vec<String> = serde_json::from_str(&tokens_json).unwrap_or_else(|e| {
                    warn!(condition = %condition_id, error = %e, "Bad token list, treating as empty");
                    Vec::new()
                });
                ConditionMeta {
                    condition_id,
                    outcome_count: u32::try_from(row.get::<i64, _>("outcome_count")).unwrap_or(2),
                    token_ids: tokens.into_iter().map(TokenId::new).collect(),
                }
            })
            .collect())
    }

    /// Outcome count per condition with metadata.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn outcome_counts(&self) -> Result<HashMap<ConditionId, u32>, sqlx::Error> {
        Ok(self
            .condition_metas()
            .await?
            .into_iter()
            .map(|m| (m.condition_id, m.outcome_count))
            .collect())
    }

    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn upsert_proxy(&self, proxy: &Address, owner: &Address) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR REPLACE INTO proxy_wallets (proxy, owner) VALUES (?, ?)")
            .bind(proxy.as_str())
            .bind(owner.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn proxy_map(&self) -> Result<ProxyMap, sqlx::Error> {
        let rows = sqlx::query("SELECT proxy, owner FROM proxy_wallets")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    Address::from_stored(row.get("proxy")),
                    Address::from_stored(row.get("owner")),
                )
            })
            .collect())
    }
}
