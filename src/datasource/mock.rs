//! In-memory feed for tests.

use super::{FeedBatch, FeedError, FeedSource};
use crate::domain::{Address, ConditionMeta, MarketResolution};
use crate::engine::{RawFill, RawRecord, RawSettlement};
use async_trait::async_trait;

/// Mock feed that returns predefined records.
#[derive(Debug, Clone, Default)]
pub struct MockFeedSource {
    events: Vec<RawRecord>,
    resolutions: Vec<MarketResolution>,
    conditions: Vec<ConditionMeta>,
    proxies: Vec<(Address, Address)>,
}

impl MockFeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fill(mut self, fill: RawFill) -> Self {
        self.events.push(RawRecord::Fill(fill));
        self
    }

    pub fn with_settlement(mut self, settlement: RawSettlement) -> Self {
        self.events.push(RawRecord::Settlement(settlement));
        self
    }

    pub fn with_records(mut self, records: Vec<RawRecord>) -> Self {
        self.events.extend(records);
        self
    }

    pub fn with_resolution(mut self, resolution: MarketResolution) -> Self {
        self.resolutions.push(resolution);
        self
    }

    pub fn with_condition(mut self, meta: ConditionMeta) -> Self {
        self.conditions.push(meta);
        self
    }

    pub fn with_proxy(mut self, proxy: Address, owner: Address) -> Self {
        self.proxies.push((proxy, owner));
        self
    }
}

#[async_trait]
impl FeedSource for MockFeedSource {
    async fn fetch_events(&self) -> Result<FeedBatch<RawRecord>, FeedError> {
        Ok(FeedBatch::new(self.events.clone()))
    }

    async fn fetch_resolutions(&self) -> Result<FeedBatch<MarketResolution>, FeedError> {
        Ok(FeedBatch::new(self.resolutions.clone()))
    }

    async fn fetch_conditions(&self) -> Result<FeedBatch<ConditionMeta>, FeedError> {
        Ok(FeedBatch::new(self.conditions.clone()))
    }

    async fn fetch_proxies(&self) -> Result<FeedBatch<(Address, Address)>, FeedError> {
        Ok(FeedBatch::new(self.proxies.clone()))
    }
}
