use crate::datasource::FeedSource;
use crate::db::Repository;
use crate::domain::LedgerError;
use crate::engine::Normalizer;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::PipelineError;

/// Loads a feed into the event store.
#[derive(Clone)]
pub struct Ingestor {
    feed: Arc<dyn FeedSource>,
    repo: Arc<Repository>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub records_read: usize,
    pub trades_new: usize,
    pub settlements_new: usize,
    /// Stored events replaced by a record with a later `written_at`.
    pub trades_superseded: usize,
    pub settlements_superseded: usize,
    /// Records superseded by a later write of the same `(tx_hash, log_index)`.
    pub duplicates_dropped: usize,
    /// Rows rejected by the feed parser or the normalizer.
    pub rejected: usize,
    pub resolutions: usize,
    pub conditions: usize,
    pub proxies: usize,
}

impl Ingestor {
    pub fn new(feed: Arc<dyn FeedSource>, repo: Arc<Repository>) -> Self {
        Self { feed, repo }
    }

    /// Import reference data first, then events.
    ///
    /// Proxies are loaded before events so that events from a proxy are attributed to its
    /// owner. Re-running with the same feed inserts nothing new; a record with a later
    /// `written_at` replaces the stored one and marks its wallet for rebuild.
    pub async fn ingest(&self) -> Result<IngestReport, PipelineError> {
        let mut report = IngestReport::default();
        let mut rejected: Vec<LedgerError> = Vec::new();

        let proxies = self.feed.fetch_proxies().await?;
        for (proxy, owner) in &proxies.items {
            self.repo.upsert_proxy(proxy, owner).await?;
        }
        report.proxies = proxies.items.len();
        rejected.extend(proxies.rejected);

        let conditions = self.feed.fetch_conditions().await?;
        for meta in &conditions.items {
            self.repo.upsert_condition_meta(meta).await?;
        }
        report.conditions = conditions.items.len();
        rejected.extend(conditions.rejected);

        let resolutions = self.feed.fetch_resolutions().await?;
        for resolution in &resolutions.items {
            self.repo.upsert_resolution(resolution).await?;
        }
        report.resolutions = resolutions.items.len();
        rejected.extend(resolutions.rejected);

        let events = self.feed.fetch_events().await?;
        report.records_read = events.items.len();
        rejected.extend(events.rejected);

        let normalizer = Normalizer::new(self.repo.proxy_map().await?);
        let batch = normalizer.normalize(events.items);
        report.duplicates_dropped = batch.duplicates_dropped;
        let trades = self.repo.upsert_trades(&batch.trades, &batch.written_at).await?;
        let settlements = self
            .repo
            .upsert_settlements(&batch.settlements, &batch.written_at)
            .await?;
        report.trades_new = trades.inserted;
        report.trades_superseded = trades.superseded;
        report.settlements_new = settlements.inserted;
        report.settlements_superseded = settlements.superseded;
        rejected.extend(batch.errors.into_vec());

        report.rejected = rejected.len();
        self.repo.record_errors(&rejected).await?;

        info!(
            records = report.records_read,
            trades_new = report.trades_new,
            settlements_new = report.settlements_new,
            superseded = report.trades_superseded + report.settlements_superseded,
            duplicates = report.duplicates_dropped,
            rejected = report.rejected,
            "Ingested feed"
        );
        Ok(report)
    }
}
