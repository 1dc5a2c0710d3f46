//! Live-mode lifecycle of pairs against scripted venues

use super::*;
use funding_rate_arbitrage::{
    connectors::FailureKind,
    data::DataAggregator,
    trading::{Executor, PositionManager, SymbolState, TradeAction},
};

struct Harness {
    binance: Arc<ScriptedExchange>,
    bybit: Arc<ScriptedExchange>,
    aggregator: DataAggregator,
    manager: PositionManager,
}

impl Harness {
    fn new() -> Self {
        let (binance, bybit) = TestUtils::wide_btc_spread();
        let config = Arc::new(TestUtils::create_test_config(false));
        let venues = TestUtils::venues(&binance, &bybit);
        let executor = Arc::new(Executor::new(venues.clone(), config.clone(), None));
        let aggregator = DataAggregator::new(venues.clone(), config.clone(), None);
        let manager = PositionManager::new(executor, venues, config);
        Self {
            binance,
            bybit,
            aggregator,
            manager,
        }
    }
}

#[tokio::test]
async fn test_open_records_balanced_pair() {
    let h = Harness::new();
    let snapshot = h.aggregator.collect(1).await.unwrap();

    let result = h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();
    assert!(result.success);
    assert!((result.filled_notional - 200.0).abs() < 1e-6);

    let pair = h.manager.get("BTC").await.unwrap();
    assert_eq!(pair.short_exchange(), Exchange::Binance);
    assert_eq!(pair.long_exchange(), Exchange::Bybit);
    assert!(pair.delta_imbalance().abs() < 1e-6);
    assert_eq!(h.manager.state("BTC").await, SymbolState::Open);

    // Short leg goes first
    let short = h.binance.orders();
    let long = h.bybit.orders();
    assert_eq!(short[0].side, PositionSide::Short);
    assert_eq!(long[0].side, PositionSide::Long);
    assert!(!short[0].reduce_only && !long[0].reduce_only);
}

#[tokio::test]
async fn test_long_leg_failure_rolls_back_short() {
    let h = Harness::new();
    h.bybit.state().reject_opens = 1;
    let snapshot = h.aggregator.collect(1).await.unwrap();

    let result = h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();
    assert!(!result.success);
    assert!(result.rolled_back);
    assert_eq!(result.failure, Some(FailureKind::Rejected));

    assert!(h.manager.get("BTC").await.is_none());
    assert!(h.binance.held("BTC").is_none());
    assert!(h.bybit.held("BTC").is_none());

    let unwind = h.binance.orders().last().cloned().unwrap();
    assert_eq!(unwind.side, PositionSide::Long);
    assert!(unwind.reduce_only);
    assert!(!h.manager.executor().is_quarantined("BTC"));
}

#[tokio::test]
async fn test_failed_rollback_quarantines_symbol() {
    let h = Harness::new();
    h.bybit.state().reject_opens = 1;
    h.binance.state().reject_reduce_only = true;
    let snapshot = h.aggregator.collect(1).await.unwrap();

    let result = h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();
    assert!(!result.success);
    assert!(!result.rolled_back);
    assert_eq!(result.failure, Some(FailureKind::RollbackFailed));
    assert!(h.binance.held("BTC").is_some());
    assert_eq!(h.manager.state("BTC").await, SymbolState::Quarantined);

    let before = h.binance.order_count() + h.bybit.order_count();
    let retry = h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();
    assert_eq!(retry.failure, Some(FailureKind::Quarantined));
    assert_eq!(h.binance.order_count() + h.bybit.order_count(), before);

    assert!(h.manager.clear_quarantine("BTC").await);
    assert!(!h.manager.executor().is_quarantined("BTC"));
}

#[tokio::test]
async fn test_failure_breaker_blocks_after_streak() {
    let h = Harness::new();
    h.binance.state().reject_opens = 10;
    let snapshot = h.aggregator.collect(1).await.unwrap();

    for _ in 0..3 {
        let result = h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();
        assert_eq!(result.failure, Some(FailureKind::Rejected));
        assert!(!result.rolled_back);
    }
    assert_eq!(h.manager.executor().consecutive_failures(), 3);
    assert_eq!(h.binance.order_count(), 3);
    assert_eq!(h.bybit.order_count(), 0);

    let blocked = h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();
    assert!(blocked.is_blocked());
    assert_eq!(h.binance.order_count(), 3);
    assert_eq!(h.bybit.order_count(), 0);

    let stats = h.manager.stats().await;
    assert_eq!(stats.failures, 3);
    assert_eq!(stats.total_volume_usd, 0.0);
}

#[tokio::test]
async fn test_close_passes_tripped_failure_breaker() {
    let h = Harness::new();
    let snapshot = h.aggregator.collect(1).await.unwrap();
    h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();

    h.binance.set_quote("ETH", 0.0002, 3_000.0);
    h.bybit.set_quote("ETH", -0.0001, 3_000.0);
    h.binance.state().reject_opens = 3;
    let snapshot = h.aggregator.collect(2).await.unwrap();
    for _ in 0..3 {
        h.manager.open(&snapshot, "ETH", 100.0).await.unwrap();
    }
    assert!(h.manager.open(&snapshot, "ETH", 100.0).await.unwrap().is_blocked());

    let result = h.manager.close(&snapshot, "BTC").await.unwrap();
    assert!(result.success);
    assert!(h.binance.held("BTC").is_none());
    assert!(h.bybit.held("BTC").is_none());
    assert_eq!(h.manager.executor().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_reset_failures_rearms_opening() {
    let h = Harness::new();
    h.binance.state().reject_opens = 3;
    let snapshot = h.aggregator.collect(1).await.unwrap();
    for _ in 0..3 {
        h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();
    }
    assert!(h.manager.open(&snapshot, "BTC", 100.0).await.unwrap().is_blocked());

    h.manager.reset_failures();
    assert_eq!(h.manager.executor().consecutive_failures(), 0);
    assert!(h
        .manager
        .executor()
        .check_breakers(TradeAction::Open, &snapshot, "BTC")
        .is_none());
    let result = h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();
    assert!(result.success);
    assert_eq!(h.manager.state("BTC").await, SymbolState::Open);
}

#[tokio::test]
async fn test_rotation_keeps_pair_shape() {
    let h = Harness::new();
    let snapshot = h.aggregator.collect(1).await.unwrap();
    h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();
    let before = h.manager.get("BTC").await.unwrap();

    let snapshot = h.aggregator.collect(2).await.unwrap();
    let result = h.manager.rotate(&snapshot, "BTC").await.unwrap();
    assert!(result.success);

    let after = h.manager.get("BTC").await.unwrap();
    assert_eq!(after.short_exchange(), before.short_exchange());
    assert_eq!(after.long_exchange(), before.long_exchange());
    assert!((after.target_notional_usd - before.target_notional_usd).abs() < 1e-6);
    assert_eq!(after.opened_at, before.opened_at);
    assert!(after.last_rotated_at.is_some());

    let stats = h.manager.stats().await;
    assert_eq!(stats.rotations, 1);
    assert!((stats.total_volume_usd - 600.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_rotation_follows_reversed_spread() {
    let h = Harness::new();
    let snapshot = h.aggregator.collect(1).await.unwrap();
    h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();

    h.binance.set_quote("BTC", -0.0001, 50_000.0);
    h.bybit.set_quote("BTC", 0.0002, 50_000.0);
    let snapshot = h.aggregator.collect(2).await.unwrap();
    assert!(h.manager.rotate(&snapshot, "BTC").await.unwrap().success);

    let pair = h.manager.get("BTC").await.unwrap();
    assert_eq!(pair.short_exchange(), Exchange::Bybit);
    assert_eq!(pair.long_exchange(), Exchange::Binance);
    assert_eq!(h.binance.held("BTC").unwrap().side, PositionSide::Long);
}

#[tokio::test]
async fn test_partial_close_keeps_record() {
    let h = Harness::new();
    let snapshot = h.aggregator.collect(1).await.unwrap();
    h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();

    h.bybit.state().reject_reduce_only = true;
    let result = h.manager.close(&snapshot, "BTC").await.unwrap();
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::PartialClose));
    assert!(h.binance.held("BTC").is_none());
    assert!(h.bybit.held("BTC").is_some());
    assert!(h.manager.get("BTC").await.is_some());
}

#[tokio::test]
async fn test_close_without_pair_is_error() {
    let h = Harness::new();
    let snapshot = h.aggregator.collect(1).await.unwrap();
    assert!(h.manager.close(&snapshot, "BTC").await.is_err());
    assert_eq!(h.binance.order_count() + h.bybit.order_count(), 0);
}

#[tokio::test]
async fn test_sync_repairs_orphaned_leg() {
    let h = Harness::new();
    h.binance
        .open_position("BTC", PositionSide::Short, 100.0, false)
        .await;
    let snapshot = h.aggregator.collect(1).await.unwrap();

    let report = h.manager.sync(&snapshot).await;
    assert_eq!(report.orphans.len(), 1);
    assert_eq!(report.orphans[0].exchange, Exchange::Binance);

    assert_eq!(h.manager.repair_orphans(&report).await, 1);
    assert!(h.binance.held("BTC").is_none());
    assert!(h.manager.get("BTC").await.is_none());
}

#[tokio::test]
async fn test_sync_skips_unknown_positions() {
    let h = Harness::new();
    let snapshot = h.aggregator.collect(1).await.unwrap();
    h.manager.open(&snapshot, "BTC", 100.0).await.unwrap();

    h.bybit.state().positions_unavailable = true;
    let snapshot = h.aggregator.collect(2).await.unwrap();
    let report = h.manager.sync(&snapshot).await;
    assert!(report.orphans.is_empty());
    assert!(h.manager.get("BTC").await.is_some());
}
