//! Binance adapter against a mock HTTP server

use super::*;
use chrono::Utc;
use funding_rate_arbitrage::{
    connectors::{rest::sign_hmac_sha256, BinanceAdapter, FailureKind, RequestThrottle, RestClient},
    data::VolatilityReading,
    trading::Executor,
    MarketSnapshot,
};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> BinanceAdapter {
    let mut config = TestUtils::create_test_config(false);
    config.execution.max_retry_attempts = 3;
    config.execution.retry_backoff_ms = 1;
    config.execution.max_retry_backoff_ms = 2;
    config.exchanges.binance.api_key = "test-key".to_string();
    config.exchanges.binance.secret_key = "test-secret".to_string();

    let client = RestClient::new(
        &server.uri(),
        &config.execution,
        Arc::new(RequestThrottle::per_second(100)),
    )
    .unwrap();
    BinanceAdapter::new(client, config.exchanges.binance.clone(), "USDT".to_string())
}

async fn mount_premium_index(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/fapi/v1/premiumIndex"))
        .and(query_param("symbol", "BTCUSDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbol": "BTCUSDT",
            "markPrice": "50000.00",
            "indexPrice": "49990.00",
            "lastFundingRate": "0.00020000",
            "nextFundingTime": 1_700_006_400_000_i64,
            "time": 1_700_000_000_000_i64
        })))
        .mount(server)
        .await;
}

async fn mount_exchange_info(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/fapi/v1/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbols": [
                {
                    "symbol": "BTCUSDT",
                    "quoteAsset": "USDT",
                    "filters": [
                        {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                        {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"}
                    ]
                },
                {
                    "symbol": "BTCBUSD",
                    "quoteAsset": "BUSD",
                    "filters": [{"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"}]
                }
            ]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_funding_quote_is_annualized() {
    let server = MockServer::start().await;
    mount_premium_index(&server).await;

    let quote = adapter(&server).get_funding_info("BTC").await.unwrap();
    assert_eq!(quote.exchange, Exchange::Binance);
    assert_eq!(quote.rate, 0.0002);
    assert_eq!(quote.mark_price, 50_000.0);
    assert!((quote.annualized_rate - 21.9).abs() < 1e-9);
    assert_eq!(quote.next_settlement_time.unwrap().timestamp_millis(), 1_700_006_400_000);
}

#[tokio::test]
async fn test_initialize_needs_lot_sizes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"symbols": []})))
        .mount(&server)
        .await;

    assert!(!adapter(&server).initialize().await);
}

#[tokio::test]
async fn test_market_order_is_signed_and_floored() {
    let server = MockServer::start().await;
    mount_exchange_info(&server).await;
    mount_premium_index(&server).await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .and(header("X-MBX-APIKEY", "test-key"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("side", "SELL"))
        .and(query_param("type", "MARKET"))
        .and(query_param("quantity", "0.002"))
        .and(query_param("reduceOnly", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orderId": 42,
            "status": "FILLED",
            "cumQuote": "100.00"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    assert!(adapter.initialize().await);
    let result = adapter.open_position("BTC", PositionSide::Short, 130.0, false).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.order_id_a.as_deref(), Some("42"));
    assert_eq!(result.filled_notional, 100.0);

    let requests = server.received_requests().await.unwrap();
    let order = requests.iter().find(|r| r.url.path() == "/fapi/v1/order").unwrap();
    let query = order.url.query().unwrap();
    let (payload, signature) = query.rsplit_once("&signature=").unwrap();
    assert!(payload.contains("&recvWindow=5000&timestamp="));
    assert_eq!(signature, sign_hmac_sha256("test-secret", payload).unwrap());
}

#[tokio::test]
async fn test_order_below_minimum_is_not_sent() {
    let server = MockServer::start().await;
    mount_exchange_info(&server).await;
    mount_premium_index(&server).await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    assert!(adapter.initialize().await);
    let result = adapter.open_position("BTC", PositionSide::Long, 20.0, false).await;
    assert_eq!(result.failure, Some(FailureKind::Rejected));
}

#[tokio::test]
async fn test_public_reads_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/premiumIndex"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .expect(3)
        .mount(&server)
        .await;

    assert!(adapter(&server).get_funding_info("BTC").await.is_none());
}

#[tokio::test]
async fn test_orders_are_not_retried() {
    let server = MockServer::start().await;
    mount_exchange_info(&server).await;
    mount_premium_index(&server).await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    assert!(adapter.initialize().await);
    let result = adapter.open_position("BTC", PositionSide::Long, 100.0, false).await;
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Rejected));
}

#[tokio::test]
async fn test_close_sends_reduce_only_for_held_size() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/positionRisk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "symbol": "BTCUSDT",
                "positionAmt": "-0.003",
                "entryPrice": "50000.0",
                "markPrice": "50100.0",
                "unRealizedProfit": "-0.30"
            },
            {
                "symbol": "ETHUSDT",
                "positionAmt": "0.000",
                "entryPrice": "0.0",
                "markPrice": "3000.0",
                "unRealizedProfit": "0.0"
            }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .and(query_param("side", "BUY"))
        .and(query_param("quantity", "0.003"))
        .and(query_param("reduceOnly", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orderId": 7,
            "status": "FILLED",
            "cumQuote": "150.30"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    let positions = adapter.get_all_positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].side, PositionSide::Short);

    let result = adapter.close_position("BTC").await;
    assert!(result.success);
    assert_eq!(result.filled_notional, 150.3);
    assert!(adapter.close_position("ETH").await.success);
}

/// Live executor shorting on the mock Binance and going long on a scripted Bybit
fn live_executor(binance: Arc<BinanceAdapter>, bybit: Arc<ScriptedExchange>) -> Executor {
    let binance: Arc<dyn ExchangeAdapter> = binance;
    let bybit: Arc<dyn ExchangeAdapter> = bybit;
    let venues = VenuePair::new(binance, bybit).unwrap();
    Executor::new(venues, Arc::new(TestUtils::create_test_config(false)), None)
}

fn funded_snapshot() -> MarketSnapshot {
    let mut snapshot = MarketSnapshot::new(1, Exchange::Binance, Exchange::Bybit, Utc::now());
    snapshot.insert_quotes(
        FundingQuote::new("BTC", Exchange::Binance, 0.0002, 50_000.0, None, DEFAULT_PERIODS_PER_YEAR),
        FundingQuote::new("BTC", Exchange::Bybit, -0.0001, 50_000.0, None, DEFAULT_PERIODS_PER_YEAR),
        DEFAULT_PERIODS_PER_YEAR,
    );
    snapshot.volatility.insert(
        "BTC".to_string(),
        VolatilityReading { volatility_pct: Some(0.1), is_safe: true, samples: 5 },
    );
    snapshot.max_position_size = Some(1_000.0);
    snapshot
}

fn position_risk(amount: &str) -> serde_json::Value {
    json!([{
        "symbol": "BTCUSDT",
        "positionAmt": amount,
        "entryPrice": "50000.0",
        "markPrice": "50100.0",
        "unRealizedProfit": "0.0"
    }])
}

#[tokio::test]
async fn test_rollback_unwinds_filled_quantity_after_mark_moves() {
    let server = MockServer::start().await;
    mount_exchange_info(&server).await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/premiumIndex"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbol": "BTCUSDT",
            "markPrice": "50000.00",
            "lastFundingRate": "0.00020000"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/premiumIndex"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbol": "BTCUSDT",
            "markPrice": "50100.00",
            "lastFundingRate": "0.00020000"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/positionRisk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(position_risk("-0.002")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/positionRisk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .and(query_param("side", "SELL"))
        .and(query_param("quantity", "0.002"))
        .and(query_param("reduceOnly", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orderId": 1,
            "status": "FILLED",
            "cumQuote": "100.00"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .and(query_param("side", "BUY"))
        .and(query_param("quantity", "0.002"))
        .and(query_param("reduceOnly", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orderId": 2,
            "status": "FILLED",
            "cumQuote": "100.20"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let binance = Arc::new(adapter(&server));
    assert!(binance.initialize().await);
    let bybit = Arc::new(ScriptedExchange::new(Exchange::Bybit).with_quote("BTC", -0.0001, 50_000.0));
    bybit.state().reject_opens = 1;
    let executor = live_executor(binance, bybit.clone());
    let snapshot = funded_snapshot();

    let result = executor.open(&snapshot, "BTC", 130.0).await;
    assert!(!result.success);
    assert!(result.rolled_back, "{:?}", result.error);
    assert_eq!(result.failure, Some(FailureKind::Rejected));
    assert!(!executor.is_quarantined("BTC"));
    assert_eq!(bybit.order_count(), 1);

    let requests = server.received_requests().await.unwrap();
    let orders: Vec<_> = requests.iter().filter(|r| r.url.path() == "/fapi/v1/order").collect();
    assert_eq!(orders.len(), 2);
}

#[tokio::test]
async fn test_rollback_with_residual_position_quarantines() {
    let server = MockServer::start().await;
    mount_exchange_info(&server).await;
    mount_premium_index(&server).await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/positionRisk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(position_risk("-0.002")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/positionRisk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(position_risk("-0.001")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orderId": 3,
            "status": "FILLED",
            "cumQuote": "100.00"
        })))
        .expect(2)
        .mount(&server)
        .await;

    let binance = Arc::new(adapter(&server));
    assert!(binance.initialize().await);
    let bybit = Arc::new(ScriptedExchange::new(Exchange::Bybit).with_quote("BTC", -0.0001, 50_000.0));
    bybit.state().reject_opens = 1;
    let executor = live_executor(binance, bybit);
    let snapshot = funded_snapshot();

    let result = executor.open(&snapshot, "BTC", 130.0).await;
    assert!(!result.rolled_back);
    assert_eq!(result.failure, Some(FailureKind::RollbackFailed));
    assert!(executor.is_quarantined("BTC"));
}
