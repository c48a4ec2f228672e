pub mod errors;
pub mod health;
pub mod mappings;
pub mod markets;
pub mod pnl;
pub mod positions;

use crate::config::Config;
use crate::db::Repository;
use crate::domain::{Address, ConditionId, SettlementPolicy};
use crate::error::AppError;
use crate::orchestration::Orchestrator;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(repo: Arc<Repository>, config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            repo,
            config,
            orchestrator,
        }
    }
}

pub(crate) fn parse_wallet(input: &str) -> Result<Address, AppError> {
    Address::parse(input).map_err(|_| AppError::BadRequest("Invalid wallet address".to_string()))
}

pub(crate) fn parse_condition(input: &str) -> Result<ConditionId, AppError> {
    ConditionId::parse(input).map_err(|_| AppError::BadRequest("Invalid conditionId".to_string()))
}

pub(crate) fn parse_policy(input: Option<&str>) -> Result<Option<SettlementPolicy>, AppError> {
    input
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<SettlementPolicy>()
                .map_err(|e| AppError::BadRequest(format!("Invalid policy: {}", e)))
        })
        .transpose()
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/pnl", get(pnl::get_pnl))
        .route("/v1/markets/pnl", get(markets::get_market_pnl))
        .route("/v1/positions", get(positions::get_positions))
        .route("/v1/mappings", get(mappings::get_mappings))
        .route("/v1/errors", get(errors::get_errors))
        .layer(cors)
        .with_state(state)
}
