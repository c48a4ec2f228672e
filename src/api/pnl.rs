use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{parse_policy, parse_wallet, AppState};
use crate::domain::{PnlWindow, TimeMs, WalletPnL};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlQuery {
    pub wallet: String,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    pub policy: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlResponse {
    pub wallet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_ms: Option<i64>,
    pub policy: String,
    pub realized_pnl: String,
    pub unrealized_pnl: String,
    pub total_pnl: String,
    pub unrealized_winner_value: String,
    pub resolved_count: usize,
    pub total_count: usize,
    pub coverage_pct: String,
    pub insufficient_coverage: bool,
    pub mapping_version: i64,
}

impl From<WalletPnL> for PnlResponse {
    fn from(pnl: WalletPnL) -> Self {
        Self {
            wallet: pnl.wallet.to_string(),
            from_ms: pnl.window.from_ms.map(|t| t.as_ms()),
            to_ms: pnl.window.to_ms.map(|t| t.as_ms()),
            policy: pnl.policy.to_string(),
            realized_pnl: pnl.realized_pnl.to_canonical_string(),
            unrealized_pnl: pnl.unrealized_pnl.to_canonical_string(),
            total_pnl: pnl.total_pnl.to_canonical_string(),
            unrealized_winner_value: pnl.unrealized_winner_value.to_canonical_string(),
            resolved_count: pnl.coverage.resolved_count,
            total_count: pnl.coverage.total_count,
            coverage_pct: pnl.coverage.coverage_pct.to_canonical_string(),
            insufficient_coverage: pnl.coverage.insufficient_coverage,
            mapping_version: pnl.mapping_version,
        }
    }
}

pub async fn get_pnl(
    Query(params): Query<PnlQuery>,
    State(state): State<AppState>,
) -> Result<Json<PnlResponse>, AppError> {
    let wallet = parse_wallet(&params.wallet)?;
    let policy = parse_policy(params.policy.as_deref())?;

    let from_ms = params.from_ms.map(TimeMs::new);
    let to_ms = params.to_ms.map(TimeMs::new);
    if let (Some(from), Some(to)) = (from_ms, to_ms) {
        if from > to {
            return Err(AppError::BadRequest("fromMs must be <= toMs".to_string()));
        }
    }

    let pnl = state
        .orchestrator
        .wallet_pnl(&wallet, PnlWindow::between(from_ms, to_ms), policy)
        .await?;

    Ok(Json(pnl.into()))
}
