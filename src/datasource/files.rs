//! Local feed directory: CSV files, optionally LZ4-framed.
//!
//! Expected files (each may also be present as `<name>.csv.lz4`):
//! - `trades.csv`: wallet,token_id,token_delta,usdc_delta,fee,tx_hash,log_index,time_ms,written_at
//! - `settlements.csv`: wallet,condition_id,outcome_index,kind,shares,usdc_delta,tx_hash,
//!   log_index,time_ms,written_at
//! - `resolutions.csv`: condition_id,winning_outcome_index,payout_numerators,payout_denominator,
//!   resolved_at (numerators separated by `;`)
//! - `conditions.csv`: condition_id,outcome_count,token_ids (tokens separated by `;`)
//! - `proxies.csv`: proxy,owner
//!
//! A missing file is an empty feed.

use super::{FeedBatch, FeedError, FeedSource};
use crate::domain::{
    Address, ConditionId, ConditionMeta, Decimal, LedgerError, LedgerErrorKind, MarketResolution,
    OutcomeIndex, TimeMs, TokenId,
};
use crate::engine::{RawFill, RawRecord, RawSettlement};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FileFeedSource {
    dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TradeRow {
    wallet: String,
    token_id: String,
    token_delta: String,
    usdc_delta: String,
    fee: String,
    tx_hash: String,
    log_index: i64,
    time_ms: i64,
    written_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SettlementRow {
    wallet: String,
    condition_id: String,
    outcome_index: Option<OutcomeIndex>,
    kind: String,
    shares: String,
    usdc_delta: String,
    tx_hash: String,
    log_index: i64,
    time_ms: i64,
    written_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ResolutionRow {
    condition_id: String,
    winning_outcome_index: OutcomeIndex,
    payout_numerators: String,
    payout_denominator: u64,
    resolved_at: i64,
}

#[derive(Debug, Deserialize)]
struct ConditionRow {
    condition_id: String,
    outcome_count: u32,
    token_ids: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProxyRow {
    proxy: String,
    owner: String,
}

fn malformed(path: &str, line: usize, detail: impl std::fmt::Display) -> LedgerError {
    warn!(path, line, detail = %detail, "Rejected feed row");
    LedgerError::new(
        LedgerErrorKind::MalformedEvent,
        format!("{} line {}: {}", path, line, detail),
    )
}

fn decimal_field(raw: &str, field: &str) -> Result<Decimal, String> {
    Decimal::from_str_canonical(raw.trim()).map_err(|e| format!("invalid {}: {}", field, e))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(';').map(str::trim).filter(|s| !s.is_empty())
}

impl FileFeedSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn decompress_lz4_frame(lz4_bytes: &[u8]) -> Result<Vec<u8>, String> {
        let mut decoder = lz4_flex::frame::FrameDecoder::new(lz4_bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| e.to_string())?;
        Ok(out)
    }

    /// Read `<name>.csv`, falling back to `<name>.csv.lz4`. `None` when neither exists.
    async fn read_feed(&self, name: &str) -> Result<Option<(String, Vec<u8>)>, FeedError> {
        let plain = self.dir.join(format!("{}.csv", name));
        let framed = self.dir.join(format!("{}.csv.lz4", name));

        for (path, compressed) in [(plain, false), (framed, true)] {
            let shown = path.display().to_string();
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let bytes = if compressed {
                        Self::decompress_lz4_frame(&bytes).map_err(|detail| FeedError::Lz4 {
                            path: shown.clone(),
                            detail,
                        })?
                    } else {
                        bytes
                    };
                    debug!(path = %shown, bytes = bytes.len(), "Read feed file");
                    return Ok(Some((shown, bytes)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(FeedError::Io {
                        path: shown,
                        source,
                    })
                }
            }
        }
        Ok(None)
    }

    /// Deserialize rows and convert each one; conversion failures become rejected rows.
    ///
    /// Line numbers count the header as line 1.
    pub fn parse_rows<R, T>(
        path: &str,
        bytes: &[u8],
        mut convert: impl FnMut(R) -> Result<T, String>,
    ) -> Result<FeedBatch<T>, FeedError>
    where
        R: DeserializeOwned,
    {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers = reader.headers().map_err(|e| FeedError::Csv {
            path: path.to_string(),
            detail: e.to_string(),
        })?;
        if headers.is_empty() {
            return Ok(FeedBatch::default());
        }

        let mut batch = FeedBatch::default();
        for (i, record) in reader.deserialize::<R>().enumerate() {
            let line = i + 2;
            match record.map_err(|e| e.to_string()).and_then(&mut convert) {
                Ok(item) => batch.items.push(item),
                Err(detail) => batch.rejected.push(malformed(path, line, detail)),
            }
        }
        Ok(batch)
    }

    async fn load<R, T>(
        &self,
        name: &str,
        convert: impl FnMut(R) -> Result<T, String>,
    ) -> Result<FeedBatch<T>, FeedError>
    where
        R: DeserializeOwned,
    {
        let Some((path, bytes)) = self.read_feed(name).await? else {
            debug!(feed = name, dir = %self.dir.display(), "Feed file missing, treating as empty");
            return Ok(FeedBatch::default());
        };
        let batch = Self::parse_rows(&path, &bytes, convert)?;
        info!(
            path = %path,
            rows = batch.items.len(),
            rejected = batch.rejected.len(),
            "Loaded feed"
        );
        Ok(batch)
    }
}

fn convert_trade(row: TradeRow) -> Result<RawRecord, String> {
    Ok(RawRecord::Fill(RawFill {
        wallet: row.wallet,
        token_id: row.token_id,
        token_delta: decimal_field(&row.token_delta, "token_delta")?,
        usdc_delta: decimal_field(&row.usdc_delta, "usdc_delta")?,
        fee: decimal_field(&row.fee, "fee")?,
        tx_hash: row.tx_hash,
        log_index: row.log_index,
        time_ms: row.time_ms,
        written_at: row.written_at.unwrap_or(row.time_ms),
    }))
}

fn convert_settlement(row: SettlementRow) -> Result<RawRecord, String> {
    Ok(RawRecord::Settlement(RawSettlement {
        wallet: row.wallet,
        condition_id: row.condition_id,
        outcome_index: row.outcome_index,
        kind: row.kind,
        shares: decimal_field(&row.shares, "shares")?,
        usdc_delta: decimal_field(&row.usdc_delta, "usdc_delta")?,
        tx_hash: row.tx_hash,
        log_index: row.log_index,
        time_ms: row.time_ms,
        written_at: row.written_at.unwrap_or(row.time_ms),
    }))
}

fn convert_resolution(row: ResolutionRow) -> Result<MarketResolution, String> {
    let numerators = split_list(&row.payout_numerators)
        .map(|n| n.parse::<u64>().map_err(|e| format!("invalid payout numerator {}: {}", n, e)))
        .collect::<Result<Vec<_>, _>>()?;
    MarketResolution::new(
        ConditionId::parse(&row.condition_id).map_err(|e| e.to_string())?,
        row.winning_outcome_index,
        numerators,
        row.payout_denominator,
        TimeMs::new(row.resolved_at),
    )
    .map_err(|e| e.to_string())
}

fn convert_condition(row: ConditionRow) -> Result<ConditionMeta, String> {
    if row.outcome_count == 0 {
        return Err("outcome_count must be > 0".to_string());
    }
    let token_ids: Vec<TokenId> = row
        .token_ids
        .as_deref()
        .map(|raw| split_list(raw).map(TokenId::new).collect())
        .unwrap_or_default();
    if !token_ids.is_empty() && token_ids.len() != row.outcome_count as usize {
        return Err(format!(
            "{} token ids for {} outcomes",
            token_ids.len(),
            row.outcome_count
        ));
    }
    Ok(ConditionMeta {
        condition_id: ConditionId::parse(&row.condition_id).map_err(|e| e.to_string())?,
        outcome_count: row.outcome_count,
        token_ids,
    })
}

fn convert_proxy(row: ProxyRow) -> Result<(Address, Address), String> {
    let proxy = Address::parse(&row.proxy).map_err(|e| e.to_string())?;
    let owner = Address::parse(&row.owner).map_err(|e| e.to_string())?;
    Ok((proxy, owner))
}

#[async_trait]
impl FeedSource for FileFeedSource {
    async fn fetch_events(&self) -> Result<FeedBatch<RawRecord>, FeedError> {
        let mut batch = self.load("trades", convert_trade).await?;
        let settlements = self.load("settlements", convert_settlement).await?;
        batch.items.extend(settlements.items);
        batch.rejected.extend(settlements.rejected);
        Ok(batch)
    }

    async fn fetch_resolutions(&self) -> Result<FeedBatch<MarketResolution>, FeedError> {
        self.load("resolutions", convert_resolution).await
    }

    async fn fetch_conditions(&self) -> Result<FeedBatch<ConditionMeta>, FeedError> {
        self.load("conditions", convert_condition).await
    }

    async fn fetch_proxies(&self) -> Result<FeedBatch<(Address, Address)>, FeedError> {
        self.load("proxies", convert_proxy).await
    }
}
