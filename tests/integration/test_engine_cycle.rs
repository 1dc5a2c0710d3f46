//! Dry-run engine cycles over scripted market data

use super::*;
use funding_rate_arbitrage::{
    strategy::{AdvisoryProvider, ArbitrageEngine, Decision, DecisionAction},
    trading::ArbPosition,
    ArbitrageError, MarketSnapshot,
};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn engine(config: ArbitrageConfig) -> (ArbitrageEngine, Arc<ScriptedExchange>, Arc<ScriptedExchange>) {
    let (binance, bybit) = TestUtils::wide_btc_spread();
    let venues = TestUtils::venues(&binance, &bybit);
    (ArbitrageEngine::new(Arc::new(config), venues), binance, bybit)
}

/// Proposes opening BTC with directions opposite to the funding data
struct BackwardsAdvisor;

#[async_trait]
impl AdvisoryProvider for BackwardsAdvisor {
    async fn propose(&self, _snapshot: &MarketSnapshot, _positions: &[ArbPosition]) -> Option<Decision> {
        Some(Decision {
            action: DecisionAction::Open,
            asset: Some("BTC".to_string()),
            target_asset: None,
            exchange_a_direction: Some(PositionSide::Long),
            exchange_b_direction: Some(PositionSide::Short),
            confidence: 0.95,
            reasoning: "binance longs are cheap".to_string(),
        })
    }
}

#[tokio::test]
async fn test_cycle_opens_best_spread_on_paper() {
    let (mut engine, binance, bybit) = engine(TestUtils::create_test_config(true));
    assert_ok!(engine.initialize().await);

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.cycle, 1);
    assert_eq!(report.decision.action, DecisionAction::Open);
    assert_eq!(report.decision.asset.as_deref(), Some("BTC"));
    assert!(report.executed.as_ref().unwrap().success);

    let pair = engine.manager().get("BTC").await.unwrap();
    assert_eq!(pair.short_exchange(), Exchange::Binance);
    assert_eq!(pair.long_exchange(), Exchange::Bybit);

    let paper = engine.ledger().unwrap().metrics().await;
    assert!((paper.total_volume - 200.0).abs() < 1e-6);
    assert_eq!(binance.order_count() + bybit.order_count(), 0);
}

#[tokio::test]
async fn test_volume_counts_both_legs() {
    let (mut engine, _binance, _bybit) = engine(TestUtils::create_test_config(true));
    engine.run_cycle().await.unwrap();

    let snapshot = engine.snapshot().await.unwrap();
    assert!(engine.manager().close(&snapshot, "BTC").await.unwrap().success);

    let stats = engine.manager().stats().await;
    assert_eq!(stats.trades, 2);
    assert!((stats.total_volume_usd - 400.0).abs() < 1e-6);
    assert_eq!(stats.active_symbols, 0);
}

#[tokio::test]
async fn test_held_pair_holds_next_cycle() {
    let (mut engine, _binance, _bybit) = engine(TestUtils::create_test_config(true));
    engine.run_cycle().await.unwrap();

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.decision.action, DecisionAction::Hold);
    assert!(report.executed.is_none());
    assert!(report.rotations.is_empty());
    assert_eq!(engine.manager().positions().await.len(), 1);

    engine.reset_failures();
    assert_eq!(engine.manager().executor().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_collapsed_spread_closes_pair() {
    let (mut engine, binance, bybit) = engine(TestUtils::create_test_config(true));
    engine.run_cycle().await.unwrap();

    binance.set_quote("BTC", 0.000005, 50_000.0);
    bybit.set_quote("BTC", 0.0, 50_000.0);
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.decision.action, DecisionAction::Close);
    assert!(report.executed.unwrap().success);
    assert!(engine.manager().get("BTC").await.is_none());
}

#[tokio::test]
async fn test_cycle_without_quotes_is_no_market_data() {
    let (mut engine, binance, _bybit) = engine(TestUtils::create_test_config(true));
    binance.clear_quotes();

    let err = assert_err!(engine.run_cycle().await);
    assert!(matches!(
        err.downcast_ref::<ArbitrageError>(),
        Some(ArbitrageError::NoMarketData)
    ));
    assert!(engine.manager().positions().await.is_empty());
}

#[tokio::test]
async fn test_rejected_proposal_falls_back_to_rules() {
    let (engine, _binance, _bybit) = engine(TestUtils::create_test_config(true));
    let mut engine = engine.with_advisor(Arc::new(BackwardsAdvisor));

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.decision.action, DecisionAction::Open);
    assert_eq!(report.decision.exchange_a_direction, Some(PositionSide::Short));
    assert_eq!(report.decision.exchange_b_direction, Some(PositionSide::Long));

    let pair = engine.manager().get("BTC").await.unwrap();
    assert_eq!(pair.short_exchange(), Exchange::Binance);
}

#[tokio::test]
async fn test_run_closes_pairs_on_stop() {
    let mut config = TestUtils::create_test_config(true);
    config.strategy.leave_positions_open_on_shutdown = false;
    let (mut engine, _binance, _bybit) = engine(config);

    let handle = engine.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();
    });

    let summary = engine.run().await.unwrap();
    assert!(summary.cycles >= 1);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.trades, 2);
    assert!((summary.total_volume_usd - 400.0).abs() < 1e-6);
    assert!(engine.manager().positions().await.is_empty());
}

#[tokio::test]
async fn test_run_leaves_pairs_open_by_default() {
    let (mut engine, _binance, _bybit) = engine(TestUtils::create_test_config(true));

    let handle = engine.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();
    });

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.trades, 1);
    assert_eq!(engine.manager().positions().await.len(), 1);
}
