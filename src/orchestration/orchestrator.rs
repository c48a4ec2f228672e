use crate::compile::{CompileReport, Compiler};
use crate::config::Config;
use crate::db::Repository;
use crate::domain::{
    Address, ConditionId, LedgerError, LedgerErrorKind, MappingSnapshot, MarketPnL, PnlWindow,
    SettlementPolicy, WalletPnL,
};
use crate::engine::{
    aggregate_market, aggregate_wallet, settle_all, AmbiguousCondition, GroundTruth,
    OutcomeResolver, SettledPosition, WalletAggregateInput,
};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::mapping::{calibrate_condition, refresh_mappings, CalibrationReport, MappingRefresh};
use super::PipelineError;

/// Entry point for every read and write against the ledger.
///
/// Reads compile the affected wallets first, so a query always reflects every stored event.
#[derive(Clone)]
pub struct Orchestrator {
    repo: Arc<Repository>,
    compiler: Compiler,
    config: Config,
    /// Serializes snapshot publication across concurrent compiles.
    refresh_lock: Arc<Mutex<()>>,
}

impl Orchestrator {
    pub fn new(repo: Arc<Repository>, compiler: Compiler, config: Config) -> Self {
        Self {
            repo,
            compiler,
            config,
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn default_policy(&self) -> SettlementPolicy {
        self.config.settlement_policy
    }

    /// Compile a wallet. When the fold flags redemptions that no mapped inventory backs, the
    /// token mappings are re-resolved and, if the snapshot changed, the wallet is recompiled
    /// against the new version.
    pub async fn compile_wallet(&self, wallet: &Address) -> Result<CompileReport, PipelineError> {
        let report = self.compiler.compile_wallet(&self.repo, wallet).await?;
        if report.reresolve_conditions.is_empty() {
            return Ok(report);
        }

        info!(
            wallet = %wallet,
            conditions = report.reresolve_conditions.len(),
            "Unbacked redemptions found, re-resolving token mappings"
        );
        let refresh = self.refresh_mappings().await?;
        if refresh.version == report.mapping_version {
            return Ok(report);
        }
        Ok(self.compiler.compile_wallet(&self.repo, wallet).await?)
    }

    /// Compile every wallet with stored events.
    pub async fn compile_all(&self) -> Result<Vec<CompileReport>, PipelineError> {
        let wallets = self.repo.wallets().await?;
        let reports = try_join_all(wallets.iter().map(|w| self.compile_wallet(w))).await?;
        info!(wallets = reports.len(), "Compiled all wallets");
        Ok(reports)
    }

    /// Wallet P&L over `window`.
    pub async fn wallet_pnl(
        &self,
        wallet: &Address,
        window: PnlWindow,
        policy: Option<SettlementPolicy>,
    ) -> Result<WalletPnL, PipelineError> {
        let policy = policy.unwrap_or(self.config.settlement_policy);
        let report = self.compile_wallet(wallet).await?;

        let positions = self.repo.positions_for_wallet(wallet).await?;
        let resolutions = self.repo.resolutions().await?;
        let (settled, _) = settle_all(&positions, &resolutions, policy);

        let effects = if window.is_unbounded() {
            Vec::new()
        } else {
            self.repo
                .effects_for_wallet(wallet, window.from_ms, window.to_ms)
                .await?
        };

        let snapshot = Arc::new(self.repo.current_snapshot().await?);
        let trades = self.repo.trades_for_wallet(wallet).await?;
        let unmapped_positions = OutcomeResolver::new(snapshot).attach(&trades).unmapped_positions;

        Ok(aggregate_wallet(WalletAggregateInput {
            wallet,
            window,
            policy,
            settled: &settled,
            effects: &effects,
            unmapped_positions,
            coverage_floor_pct: self.config.coverage_floor_pct,
            mapping_version: report.mapping_version,
        }))
    }

    /// P&L of one condition across every wallet that traded it.
    pub async fn market_pnl(
        &self,
        condition_id: &ConditionId,
        policy: Option<SettlementPolicy>,
    ) -> Result<MarketPnL, PipelineError> {
        let policy = policy.unwrap_or(self.config.settlement_policy);
        let snapshot = self.repo.current_snapshot().await?;
        let tokens: Vec<_> = snapshot
            .for_condition(condition_id)
            .map(|m| m.token_id.clone())
            .collect();

        let wallets = self.repo.wallets_for_condition(condition_id, &tokens).await?;
        try_join_all(wallets.iter().map(|w| self.compile_wallet(w))).await?;

        let positions = self.repo.positions_for_condition(condition_id).await?;
        let resolutions = self.repo.resolutions().await?;
        let (settled, _) = settle_all(&positions, &resolutions, policy);
        Ok(aggregate_market(condition_id, policy, &settled))
    }

    /// Current positions of a wallet, priced under `policy`.
    pub async fn positions(
        &self,
        wallet: &Address,
        policy: Option<SettlementPolicy>,
    ) -> Result<Vec<SettledPosition>, PipelineError> {
        let policy = policy.unwrap_or(self.config.settlement_policy);
        self.compile_wallet(wallet).await?;
        let positions = self.repo.positions_for_wallet(wallet).await?;
        let resolutions = self.repo.resolutions().await?;
        Ok(settle_all(&positions, &resolutions, policy).0)
    }

    pub async fn current_snapshot(&self) -> Result<MappingSnapshot, PipelineError> {
        Ok(self.repo.current_snapshot().await?)
    }

    pub async fn errors(
        &self,
        wallet: Option<&Address>,
        kind: Option<LedgerErrorKind>,
    ) -> Result<Vec<LedgerError>, PipelineError> {
        Ok(self.repo.query_errors(wallet, kind).await?)
    }

    pub async fn refresh_mappings(&self) -> Result<MappingRefresh, PipelineError> {
        let _guard = self.refresh_lock.lock().await;
        refresh_mappings(&self.repo).await
    }

    /// Compile `wallet`, then calibrate `condition` against its ground truth.
    pub async fn calibrate(
        &self,
        condition: &AmbiguousCondition,
        wallet: &Address,
        ground_truth: GroundTruth,
    ) -> Result<Option<CalibrationReport>, PipelineError> {
        self.compile_wallet(wallet).await?;
        let _guard = self.refresh_lock.lock().await;
        calibrate_condition(
            &self.repo,
            &self.config.calibration(),
            condition,
            wallet,
            ground_truth,
        )
        .await
    }
}
