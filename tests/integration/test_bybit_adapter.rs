//! Bybit adapter orders against a mock HTTP server

use super::*;
use funding_rate_arbitrage::connectors::{BybitAdapter, FailureKind, RequestThrottle, RestClient};
use serde_json::json;
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> BybitAdapter {
    let mut config = TestUtils::create_test_config(false);
    config.execution.max_retry_attempts = 2;
    config.execution.retry_backoff_ms = 1;
    config.execution.max_retry_backoff_ms = 2;
    config.exchanges.bybit.api_key = "test-key".to_string();
    config.exchanges.bybit.secret_key = "test-secret".to_string();

    let client = RestClient::new(
        &server.uri(),
        &config.execution,
        Arc::new(RequestThrottle::per_second(100)),
    )
    .unwrap();
    BybitAdapter::new(client, config.exchanges.bybit.clone(), "USDT".to_string())
}

fn envelope(result: serde_json::Value) -> serde_json::Value {
    json!({"retCode": 0, "retMsg": "OK", "result": result, "time": 1_700_000_000_000_i64})
}

/// Instruments with a 0.001 step and a BTC mark of 50000
async fn mount_market(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v5/market/instruments-info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "category": "linear",
            "list": [{
                "symbol": "BTCUSDT",
                "lotSizeFilter": {"qtyStep": "0.001", "minOrderQty": "0.001"}
            }]
        }))))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v5/market/tickers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "category": "linear",
            "list": [{
                "symbol": "BTCUSDT",
                "markPrice": "50000",
                "fundingRate": "-0.0001",
                "nextFundingTime": "1700006400000"
            }]
        }))))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .and(header_exists("X-BAPI-SIGN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "orderId": "by-1",
            "orderLinkId": "fra1"
        }))))
        .expect(1)
        .mount(server)
        .await;
}

fn order_state(status: &str, qty: &str, value: &str) -> serde_json::Value {
    envelope(json!({
        "category": "linear",
        "list": [{
            "orderId": "by-1",
            "orderStatus": status,
            "cumExecQty": qty,
            "cumExecValue": value
        }]
    }))
}

#[tokio::test]
async fn test_fill_reports_executed_value() {
    let server = MockServer::start().await;
    mount_market(&server).await;
    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .and(query_param("orderId", "by-1"))
        .and(header_exists("X-BAPI-SIGN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_state("Filled", "0.002", "100.35")))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    assert!(adapter.initialize().await);
    let result = adapter.open_position("BTC", PositionSide::Long, 130.0, false).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.order_id_a.as_deref(), Some("by-1"));
    assert_eq!(result.filled_notional, 100.35);
}

#[tokio::test]
async fn test_unfilled_cancel_is_rejected() {
    let server = MockServer::start().await;
    mount_market(&server).await;
    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_state("Cancelled", "0", "0")))
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    assert!(adapter.initialize().await);
    let result = adapter.open_position("BTC", PositionSide::Short, 130.0, false).await;
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Rejected));
}

#[tokio::test]
async fn test_unreadable_order_falls_back_to_mark_estimate() {
    let server = MockServer::start().await;
    mount_market(&server).await;
    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    assert!(adapter.initialize().await);
    let result = adapter.open_position("BTC", PositionSide::Long, 130.0, false).await;
    assert!(result.success);
    assert!((result.filled_notional - 100.0).abs() < 1e-9);
}
