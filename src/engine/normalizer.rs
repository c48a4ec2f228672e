//! Event normalizer: raw feed records to canonical, deduplicated ledger events.

use crate::domain::{
    sort_settlements_deterministic, sort_trades_deterministic, Address, ConditionId, Decimal,
    ErrorLog, EventKey, LedgerError, LedgerErrorKind, OutcomeIndex, SettlementEvent,
    SettlementKind, Side, TimeMs, TokenId, TradeEvent, TxHash,
};
use std::collections::HashMap;
use tracing::info;

/// A fill as it arrives from a feed: signed token and USDC deltas, wallet possibly a proxy.
///
/// `usdc_delta` excludes the fee; the fee is always reported separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFill {
    pub wallet: String,
    pub token_id: String,
    pub token_delta: Decimal,
    pub usdc_delta: Decimal,
    pub fee: Decimal,
    pub tx_hash: String,
    pub log_index: i64,
    pub time_ms: i64,
    pub written_at: i64,
}

impl RawFill {
    /// Build from a feed that reports an explicit side, size and price.
    #[allow(clippy::too_many_arguments)]
    pub fn from_side(
        wallet: impl Into<String>,
        token_id: impl Into<String>,
        side: Side,
        shares: Decimal,
        price: Decimal,
        fee: Decimal,
        tx_hash: impl Into<String>,
        log_index: i64,
        time_ms: i64,
    ) -> Self {
        let notional = price * shares;
        let (token_delta, usdc_delta) = match side {
            Side::Buy => (shares, -notional),
            Side::Sell => (-shares, notional),
        };
        Self {
            wallet: wallet.into(),
            token_id: token_id.into(),
            token_delta,
            usdc_delta,
            fee,
            tx_hash: tx_hash.into(),
            log_index,
            time_ms,
            written_at: time_ms,
        }
    }
}

/// A split, merge or redemption log as it arrives from a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSettlement {
    pub wallet: String,
    pub condition_id: String,
    pub outcome_index: Option<OutcomeIndex>,
    pub kind: String,
    pub shares: Decimal,
    pub usdc_delta: Decimal,
    pub tx_hash: String,
    pub log_index: i64,
    pub time_ms: i64,
    pub written_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    Fill(RawFill),
    Settlement(RawSettlement),
}

impl RawRecord {
    fn tx_hash(&self) -> &str {
        match self {
            RawRecord::Fill(f) => &f.tx_hash,
            RawRecord::Settlement(s) => &s.tx_hash,
        }
    }

    fn log_index(&self) -> i64 {
        match self {
            RawRecord::Fill(f) => f.log_index,
            RawRecord::Settlement(s) => s.log_index,
        }
    }

    fn written_at(&self) -> i64 {
        match self {
            RawRecord::Fill(f) => f.written_at,
            RawRecord::Settlement(s) => s.written_at,
        }
    }
}

/// Proxy wallet → owner wallet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyMap {
    owners: HashMap<Address, Address>,
}

impl ProxyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, proxy: Address, owner: Address) {
        self.owners.insert(proxy, owner);
    }

    /// Owner of `wallet`, or `wallet` itself when it is not a known proxy.
    pub fn owner_of(&self, wallet: &Address) -> Address {
        self.owners
            .get(wallet)
            .cloned()
            .unwrap_or_else(|| wallet.clone())
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

impl FromIterator<(Address, Address)> for ProxyMap {
    fn from_iter<I: IntoIterator<Item = (Address, Address)>>(iter: I) -> Self {
        Self {
            owners: iter.into_iter().collect(),
        }
    }
}

/// Result of normalizing one batch.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub trades: Vec<TradeEvent>,
    pub settlements: Vec<SettlementEvent>,
    /// `written_at` of the surviving record for each event key.
    pub written_at: HashMap<EventKey, i64>,
    pub errors: ErrorLog,
    pub duplicates_dropped: usize,
}

/// Largest share or USDC magnitude accepted from a feed. Keeps every ledger product well
/// inside the decimal range.
const MAX_AMOUNT: i64 = 1_000_000_000_000_000;

fn out_of_range(values: &[(&str, Decimal)]) -> Option<String> {
    let limit = Decimal::from_i64(MAX_AMOUNT);
    values
        .iter()
        .find(|(_, v)| v.abs() > limit)
        .map(|(field, v)| format!("{} {} exceeds {}", field, v, limit))
}

pub struct Normalizer {
    proxies: ProxyMap,
}

impl Normalizer {
    pub fn new(proxies: ProxyMap) -> Self {
        Self { proxies }
    }

    /// Deduplicate, classify and canonicalize a batch.
    ///
    /// Duplicates by `(tx_hash, log_index)` keep the record with the highest `written_at`; on a
    /// tie the later record in input order wins. Malformed records are logged and dropped.
    pub fn normalize(&self, records: Vec<RawRecord>) -> NormalizedBatch {
        let total = records.len();
        let mut latest: HashMap<(TxHash, i64), (usize, RawRecord)> = HashMap::new();
        let mut batch = NormalizedBatch::default();

        for (position, record) in records.into_iter().enumerate() {
            let key = (TxHash::new(record.tx_hash()), record.log_index());
            let replace = match latest.get(&key) {
                Some((_, existing)) => {
                    batch.duplicates_dropped += 1;
                    existing.written_at() <= record.written_at()
                }
                None => true,
            };
            if replace {
                latest.insert(key, (position, record));
            }
        }

        let mut survivors: Vec<(usize, RawRecord)> = latest.into_values().collect();
        survivors.sort_by_key(|(position, _)| *position);

        for (_, record) in survivors {
            match record {
                RawRecord::Fill(fill) => match self.normalize_fill(&fill) {
                    Ok(trade) => {
                        batch.written_at.insert(trade.key.clone(), fill.written_at);
                        batch.trades.push(trade);
                    }
                    Err(error) => batch.errors.record(error),
                },
                RawRecord::Settlement(raw) => match self.normalize_settlement(&raw) {
                    Ok(event) => {
                        batch.written_at.insert(event.key.clone(), raw.written_at);
                        batch.settlements.push(event);
                    }
                    Err(error) => batch.errors.record(error),
                },
            }
        }

        sort_trades_deterministic(&mut batch.trades);
        sort_settlements_deterministic(&mut batch.settlements);

        info!(
            records = total,
            trades = batch.trades.len(),
            settlements = batch.settlements.len(),
            malformed = batch.errors.count(LedgerErrorKind::MalformedEvent),
            duplicates = batch.duplicates_dropped,
            "normalized batch"
        );
        batch
    }

    fn owner(&self, raw_wallet: &str) -> Result<Address, String> {
        let wallet = Address::parse(raw_wallet).map_err(|e| format!("wallet: {}", e))?;
        Ok(self.proxies.owner_of(&wallet))
    }

    fn normalize_fill(&self, raw: &RawFill) -> Result<TradeEvent, LedgerError> {
        let malformed = |detail: String| {
            let mut err = LedgerError::new(LedgerErrorKind::MalformedEvent, detail);
            if let Ok(tx) = TxHash::parse(&raw.tx_hash) {
                err = err.with_event(&EventKey::new(tx, raw.log_index));
            }
            err
        };

        let tx_hash = TxHash::parse(&raw.tx_hash)
            .map_err(|e| malformed(format!("fill tx hash: {}", e)))?;
        let key = EventKey::new(tx_hash, raw.log_index);
        let wallet = self.owner(&raw.wallet).map_err(&malformed)?;
        let token_id = TokenId::new(&raw.token_id);
        if token_id.is_empty() {
            return Err(malformed("fill has no token id".to_string()).with_wallet(&wallet));
        }
        if let Some(detail) = out_of_range(&[
            ("token_delta", raw.token_delta),
            ("usdc_delta", raw.usdc_delta),
            ("fee", raw.fee),
        ]) {
            return Err(malformed(detail).with_wallet(&wallet).with_token(&token_id));
        }
        if raw.fee.is_negative() {
            return Err(malformed(format!("negative fee {}", raw.fee))
                .with_wallet(&wallet)
                .with_token(&token_id));
        }

        let side = if raw.token_delta.is_positive() && raw.usdc_delta.is_negative() {
            Side::Buy
        } else if raw.token_delta.is_negative() && raw.usdc_delta.is_positive() {
            Side::Sell
        } else {
            return Err(malformed(format!(
                "ambiguous direction: token_delta={} usdc_delta={}",
                raw.token_delta, raw.usdc_delta
            ))
            .with_wallet(&wallet)
            .with_token(&token_id));
        };

        let shares = raw.token_delta.abs();
        let price = raw
            .usdc_delta
            .abs()
            .checked_div(shares)
            .unwrap_or_else(Decimal::zero);
        if !price.is_unit_interval() {
            return Err(malformed(format!("price {} outside [0, 1]", price))
                .with_wallet(&wallet)
                .with_token(&token_id));
        }

        Ok(TradeEvent {
            key,
            wallet,
            token_id,
            condition_id: None,
            outcome_index: None,
            side,
            shares,
            price,
            fee: raw.fee,
            time_ms: TimeMs::new(raw.time_ms),
        })
    }

    fn normalize_settlement(&self, raw: &RawSettlement) -> Result<SettlementEvent, LedgerError> {
        let malformed = |detail: String| {
            let mut err = LedgerError::new(LedgerErrorKind::MalformedEvent, detail);
            if let Ok(tx) = TxHash::parse(&raw.tx_hash) {
                err = err.with_event(&EventKey::new(tx, raw.log_index));
            }
            err
        };

        let tx_hash = TxHash::parse(&raw.tx_hash)
            .map_err(|e| malformed(format!("settlement tx hash: {}", e)))?;
        let key = EventKey::new(tx_hash, raw.log_index);
        let wallet = self.owner(&raw.wallet).map_err(&malformed)?;
        let condition_id = ConditionId::parse(&raw.condition_id)
            .map_err(|e| malformed(format!("condition id: {}", e)).with_wallet(&wallet))?;
        let kind: SettlementKind = raw
            .kind
            .parse()
            .map_err(|e: String| malformed(e).with_wallet(&wallet).with_condition(&condition_id))?;

        if let Some(detail) =
            out_of_range(&[("shares", raw.shares), ("usdc_delta", raw.usdc_delta)])
        {
            return Err(malformed(detail)
                .with_wallet(&wallet)
                .with_condition(&condition_id));
        }
        if !raw.shares.is_positive() {
            return Err(malformed(format!("{} with non-positive shares {}", kind, raw.shares))
                .with_wallet(&wallet)
                .with_condition(&condition_id));
        }
        if kind == SettlementKind::Redeem && raw.outcome_index.is_none() {
            return Err(malformed("redeem without outcome index".to_string())
                .with_wallet(&wallet)
                .with_condition(&condition_id));
        }
        let sign_ok = match kind {
            SettlementKind::Split => !raw.usdc_delta.is_positive(),
            SettlementKind::Merge | SettlementKind::Redeem => !raw.usdc_delta.is_negative(),
        };
        if !sign_ok {
            return Err(malformed(format!(
                "{} with usdc_delta {} of the wrong sign",
                kind, raw.usdc_delta
            ))
            .with_wallet(&wallet)
            .with_condition(&condition_id));
        }

        Ok(SettlementEvent {
            key,
            wallet,
            condition_id,
            outcome_index: match kind {
                SettlementKind::Redeem => raw.outcome_index,
                SettlementKind::Split | SettlementKind::Merge => None,
            },
            kind,
            shares: raw.shares,
            usdc_delta: raw.usdc_delta,
            time_ms: TimeMs::new(raw.time_ms),
        })
    }
}
