use crate::api::{parse_policy, parse_wallet, AppState};
use crate::engine::{PositionStatus, SettledPosition};
use crate::error::AppError;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionsQuery {
    pub wallet: String,
    pub policy: Option<String>,
    /// Only positions that still hold shares.
    pub open_only: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionsResponse {
    pub wallet: String,
    pub policy: String,
    pub positions: Vec<PositionDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionDto {
    pub condition_id: String,
    pub outcome_index: u32,
    pub status: PositionStatus,
    pub quantity: String,
    pub cost_basis: String,
    pub fees_paid: String,
    pub cash_flow: String,
    pub realized_pnl: String,
    pub unrealized_pnl: String,
    pub unrealized_winner_value: String,
    pub write_off: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at_ms: Option<i64>,
}

impl From<&SettledPosition> for PositionDto {
    fn from(s: &SettledPosition) -> Self {
        let p = &s.position;
        Self {
            condition_id: p.key.condition_id.to_string(),
            outcome_index: p.key.outcome_index,
            status: s.status,
            quantity: p.quantity.to_canonical_string(),
            cost_basis: p.cost_basis.to_canonical_string(),
            fees_paid: p.fees_paid.to_canonical_string(),
            cash_flow: p.cash_flow.to_canonical_string(),
            realized_pnl: s.realized_pnl.to_canonical_string(),
            unrealized_pnl: s.unrealized_pnl.to_canonical_string(),
            unrealized_winner_value: s.unrealized_winner_value.to_canonical_string(),
            write_off: s.write_off.to_canonical_string(),
            payout_price: s.payout_price.map(|d| d.to_canonical_string()),
            resolved_at_ms: s.resolved_at.map(|t| t.as_ms()),
            updated_at_ms: p.updated_at.map(|t| t.as_ms()),
        }
    }
}

pub async fn get_positions(
    Query(params): Query<PositionsQuery>,
    State(state): State<AppState>,
) -> Result<Json<PositionsResponse>, AppError> {
    let wallet = parse_wallet(&params.wallet)?;
    let policy = parse_policy(params.policy.as_deref())?
        .unwrap_or_else(|| state.orchestrator.default_policy());
    let open_only = params.open_only.unwrap_or(false);

    let settled = state.orchestrator.positions(&wallet, Some(policy)).await?;
    let positions = settled
        .iter()
        .filter(|s| !open_only || s.position.is_open())
        .map(PositionDto::from)
        .collect();

    Ok(Json(PositionsResponse {
        wallet: wallet.to_string(),
        policy: policy.to_string(),
        positions,
    }))
}
