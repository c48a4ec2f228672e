use axum::http::StatusCode;
use outcome_ledger::api::{self, AppState};
use outcome_ledger::datasource::MockFeedSource;
use outcome_ledger::domain::{ConditionMeta, MarketResolution, Side};
use outcome_ledger::engine::{RawFill, RawSettlement};
use outcome_ledger::orchestration::Ingestor;
use outcome_ledger::{
    init_db, Compiler, ConditionId, Config, Decimal, Orchestrator, Repository, SettlementPolicy,
    TimeMs, TokenId,
};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

const WALLET: &str = "0x00000000000000000000000000000000000a11ce";
const CONDITION: &str = "0xc0";

struct TestApp {
    app: axum::Router,
    _temp: TempDir,
}

fn d(s: &str) -> Decimal {
    Decimal::from_str_canonical(s).unwrap()
}

fn test_config() -> Config {
    Config {
        port: 0,
        database_path: ":memory:".to_string(),
        settlement_policy: SettlementPolicy::Asymmetric,
        coverage_floor_pct: d("2"),
        calibration_tolerance_pct: d("5"),
        calibration_iteration_factor: 3,
        fold_workers: 2,
        feed_dir: None,
    }
}

/// Buy 100 @ 0.40 (fee 0.40) at t=1000, resolution at t=5000, redeem all at t=6000.
fn feed() -> MockFeedSource {
    let condition = ConditionId::new(CONDITION);
    MockFeedSource::new()
        .with_condition(ConditionMeta {
            condition_id: condition.clone(),
            outcome_count: 2,
            token_ids: vec![TokenId::new("101"), TokenId::new("102")],
        })
        .with_resolution(MarketResolution::binary(condition, 0, TimeMs::new(5000)))
        .with_fill(RawFill::from_side(
            WALLET,
            "101",
            Side::Buy,
            d("100"),
            d("0.40"),
            d("0.40"),
            "0x01",
            0,
            1000,
        ))
        .with_settlement(RawSettlement {
            wallet: WALLET.to_string(),
            condition_id: CONDITION.to_string(),
            outcome_index: Some(0),
            kind: "PayoutRedemption".to_string(),
            shares: d("100"),
            usdc_delta: d("100"),
            tx_hash: "0x02".to_string(),
            log_index: 0,
            time_ms: 6000,
            written_at: 6000,
        })
}

async fn setup_test_app() -> TestApp {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Arc::new(Repository::new(pool));
    let config = test_config();

    Ingestor::new(Arc::new(feed()), repo.clone())
        .ingest()
        .await
        .expect("ingest failed");

    let orchestrator = Arc::new(Orchestrator::new(
        repo.clone(),
        Compiler::new(config.fold_workers).unwrap(),
        config.clone(),
    ));
    orchestrator.refresh_mappings().await.unwrap();

    let state = AppState::new(repo, config, orchestrator);
    TestApp {
        app: api::create_router(state),
        _temp: temp_dir,
    }
}

async fn request(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();

    let res = app.oneshot(req).await.unwrap();
    let status = res.status();
    let body = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_and_ready() {
    let test_app = setup_test_app().await;

    let (status, body) = request(test_app.app.clone(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = request(test_app.app, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_pnl_response_has_required_fields() {
    let test_app = setup_test_app().await;

    let (status, body) = request(test_app.app, &format!("/v1/pnl?wallet={}", WALLET)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["wallet"], WALLET);
    assert_eq!(body["policy"], "asymmetric");
    assert_eq!(body["realizedPnl"], "59.6");
    assert_eq!(body["unrealizedPnl"], "0");
    assert_eq!(body["totalPnl"], "59.6");
    assert_eq!(body["resolvedCount"], 1);
    assert_eq!(body["totalCount"], 1);
    assert_eq!(body["coveragePct"], "100");
    assert_eq!(body["insufficientCoverage"], false);
    assert_eq!(body["mappingVersion"], 1);
    assert!(body.get("fromMs").is_none());
}

#[tokio::test]
async fn test_pnl_window_counts_effects_inside_it() {
    let test_app = setup_test_app().await;

    let (status, body) = request(
        test_app.app.clone(),
        &format!("/v1/pnl?wallet={}&fromMs=5000&toMs=7000", WALLET),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["realizedPnl"], "59.6");
    assert_eq!(body["fromMs"], 5000);

    let (_, body) = request(
        test_app.app,
        &format!("/v1/pnl?wallet={}&fromMs=0&toMs=2000", WALLET),
    )
    .await;
    assert_eq!(body["realizedPnl"], "0");
}

#[tokio::test]
async fn test_pnl_rejects_bad_input() {
    let test_app = setup_test_app().await;

    let (status, body) = request(test_app.app.clone(), "/v1/pnl?wallet=not-hex").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("wallet"));

    let (status, body) = request(
        test_app.app.clone(),
        &format!("/v1/pnl?wallet={}&fromMs=10&toMs=5", WALLET),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "fromMs must be <= toMs");

    let (status, _) = request(
        test_app.app,
        &format!("/v1/pnl?wallet={}&policy=optimistic", WALLET),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cash_flow_policy_override() {
    let test_app = setup_test_app().await;

    let (status, body) = request(
        test_app.app,
        &format!("/v1/pnl?wallet={}&policy=cash_flow_only", WALLET),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["policy"], "cash_flow_only");
    // -40.40 paid, 100 redeemed
    assert_eq!(body["realizedPnl"], "59.6");
}

#[tokio::test]
async fn test_positions_endpoint() {
    let test_app = setup_test_app().await;

    let (status, body) = request(
        test_app.app.clone(),
        &format!("/v1/positions?wallet={}", WALLET),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let positions = body["positions"].as_array().unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0]["conditionId"], CONDITION);
    assert_eq!(positions[0]["outcomeIndex"], 0);
    assert_eq!(positions[0]["status"], "won");
    assert_eq!(positions[0]["quantity"], "0");
    assert_eq!(positions[0]["feesPaid"], "0.4");

    let (_, body) = request(
        test_app.app,
        &format!("/v1/positions?wallet={}&openOnly=true", WALLET),
    )
    .await;
    assert!(body["positions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_market_pnl_endpoint() {
    let test_app = setup_test_app().await;

    let (status, body) = request(
        test_app.app.clone(),
        &format!("/v1/markets/pnl?conditionId={}", CONDITION),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["walletCount"], 1);
    assert_eq!(body["resolved"], true);
    assert_eq!(body["realizedPnl"], "59.6");

    let (status, _) = request(test_app.app, "/v1/markets/pnl?conditionId=0xdead").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_mappings_endpoint() {
    let test_app = setup_test_app().await;

    let (status, body) = request(
        test_app.app.clone(),
        &format!("/v1/mappings?conditionId={}", CONDITION),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
    let mappings = body["mappings"].as_array().unwrap();
    assert_eq!(mappings.len(), 2);
    assert!(mappings
        .iter()
        .all(|m| m["source"] == "direct" && m["status"] == "production"));

    let (_, body) = request(test_app.app, "/v1/mappings?conditionId=0xdead").await;
    assert!(body["mappings"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_errors_endpoint() {
    let test_app = setup_test_app().await;

    // compile through a P&L read first
    request(test_app.app.clone(), &format!("/v1/pnl?wallet={}", WALLET)).await;

    let (status, body) = request(
        test_app.app.clone(),
        &format!("/v1/errors?wallet={}&kind=resolution_missing", WALLET),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);

    let (status, _) = request(test_app.app, "/v1/errors?kind=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
