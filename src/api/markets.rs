use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{parse_condition, parse_policy, AppState};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPnlQuery {
    pub condition_id: String,
    pub policy: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPnlResponse {
    pub condition_id: String,
    pub policy: String,
    pub resolved: bool,
    pub wallet_count: usize,
    pub position_count: usize,
    pub realized_pnl: String,
    pub unrealized_pnl: String,
    pub total_pnl: String,
    pub unrealized_winner_value: String,
}

pub async fn get_market_pnl(
    Query(params): Query<MarketPnlQuery>,
    State(state): State<AppState>,
) -> Result<Json<MarketPnlResponse>, AppError> {
    let condition_id = parse_condition(&params.condition_id)?;
    let policy = parse_policy(params.policy.as_deref())?;

    let market = state.orchestrator.market_pnl(&condition_id, policy).await?;
    if market.position_count == 0 {
        return Err(AppError::NotFound(format!(
            "No positions for condition {}",
            condition_id
        )));
    }

    Ok(Json(MarketPnlResponse {
        condition_id: market.condition_id.to_string(),
        policy: market.policy.to_string(),
        resolved: market.resolved,
        wallet_count: market.wallet_count,
        position_count: market.position_count,
        realized_pnl: market.realized_pnl.to_canonical_string(),
        unrealized_pnl: market.unrealized_pnl.to_canonical_string(),
        total_pnl: market.total_pnl.to_canonical_string(),
        unrealized_winner_value: market.unrealized_winner_value.to_canonical_string(),
    }))
}
