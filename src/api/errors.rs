use crate::api::{parse_wallet, AppState};
use crate::domain::{LedgerError, LedgerErrorKind};
use crate::error::AppError;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorsQuery {
    pub wallet: Option<String>,
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorsResponse {
    pub count: usize,
    pub errors: Vec<LedgerError>,
}

pub async fn get_errors(
    Query(params): Query<ErrorsQuery>,
    State(state): State<AppState>,
) -> Result<Json<ErrorsResponse>, AppError> {
    let wallet = params.wallet.as_deref().map(parse_wallet).transpose()?;
    let kind = match params.kind.as_deref() {
        Some(k) => Some(
            k.parse::<LedgerErrorKind>()
                .map_err(AppError::BadRequest)?,
        ),
        None => None,
    };

    let errors = state.orchestrator.errors(wallet.as_ref(), kind).await?;
    Ok(Json(ErrorsResponse {
        count: errors.len(),
        errors,
    }))
}
