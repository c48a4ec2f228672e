//! Feed abstraction for loading raw trades, settlements and reference data.

use crate::domain::{Address, ConditionMeta, LedgerError, MarketResolution};
use crate::engine::RawRecord;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

pub mod files;
pub mod mock;

pub use files::FileFeedSource;
pub use mock::MockFeedSource;

/// Rows read from a feed, plus the rows rejected while parsing.
///
/// Rejected rows are reported as `MalformedEvent` entries so they land in the error log
/// alongside the normalizer's own rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedBatch<T> {
    pub items: Vec<T>,
    pub rejected: Vec<LedgerError>,
}

impl<T> FeedBatch<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            rejected: Vec::new(),
        }
    }
}

impl<T> Default for FeedBatch<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Source of raw ledger inputs.
///
/// Event feeds return records unsorted and possibly duplicated; the normalizer owns ordering
/// and dedup.
#[async_trait]
pub trait FeedSource: Send + Sync + fmt::Debug {
    /// Trades and settlement logs.
    async fn fetch_events(&self) -> Result<FeedBatch<RawRecord>, FeedError>;

    async fn fetch_resolutions(&self) -> Result<FeedBatch<MarketResolution>, FeedError>;

    async fn fetch_conditions(&self) -> Result<FeedBatch<ConditionMeta>, FeedError>;

    /// `(proxy, owner)` pairs.
    async fn fetch_proxies(&self) -> Result<FeedBatch<(Address, Address)>, FeedError>;
}

/// Error type for feed operations that abort a whole file.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("lz4 decode error in {path}: {detail}")]
    Lz4 { path: String, detail: String },
    #[error("csv error in {path}: {detail}")]
    Csv { path: String, detail: String },
}
