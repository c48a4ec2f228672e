use crate::api::{parse_condition, AppState};
use crate::domain::{MappingSource, MappingStatus, TokenOutcomeMapping};
use crate::error::AppError;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingsQuery {
    pub condition_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingsResponse {
    pub version: i64,
    pub fingerprint: String,
    pub mappings: Vec<MappingDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDto {
    pub token_id: String,
    pub condition_id: String,
    pub outcome_index: u32,
    pub source: MappingSource,
    pub confidence: String,
    pub status: MappingStatus,
}

impl From<&TokenOutcomeMapping> for MappingDto {
    fn from(m: &TokenOutcomeMapping) -> Self {
        Self {
            token_id: m.token_id.to_string(),
            condition_id: m.condition_id.to_string(),
            outcome_index: m.outcome_index,
            source: m.source,
            confidence: m.confidence.to_canonical_string(),
            status: m.status,
        }
    }
}

/// Current mapping snapshot, optionally narrowed to one condition.
pub async fn get_mappings(
    Query(params): Query<MappingsQuery>,
    State(state): State<AppState>,
) -> Result<Json<MappingsResponse>, AppError> {
    let condition_id = params
        .condition_id
        .as_deref()
        .map(parse_condition)
        .transpose()?;

    let snapshot = state.orchestrator.current_snapshot().await?;
    let mappings = snapshot
        .iter()
        .filter(|m| {
            condition_id
                .as_ref()
                .map(|c| &m.condition_id == c)
                .unwrap_or(true)
        })
        .map(MappingDto::from)
        .collect();

    Ok(Json(MappingsResponse {
        version: snapshot.version,
        fingerprint: snapshot.fingerprint.clone(),
        mappings,
    }))
}
