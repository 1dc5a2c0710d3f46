//! Metrics recorded through the `metrics` facade
//!
//! Without an installed recorder every call is a no-op, so components record
//! unconditionally and the binary decides whether to export.

use crate::{
    connectors::{ExecutionResult, FailureKind},
    trading::{BreakerTrip, TradeAction},
    ArbitrageError, Result,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Serve Prometheus metrics on `listen_addr`
pub fn install_prometheus_exporter(listen_addr: &str) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .map_err(|e| ArbitrageError::Config(format!("Invalid metrics address {}: {}", listen_addr, e)))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ArbitrageError::Config(format!("Failed to start metrics exporter: {}", e)))?;
    Ok(())
}

/// A finished engine cycle
pub fn record_cycle(duration: Duration, success: bool) {
    ::metrics::counter!("funding_arb_cycles_total", 1, "result" => result_label(success));
    ::metrics::histogram!("funding_arb_cycle_duration_seconds", duration.as_secs_f64());
}

/// A two-leg execution that reached the executor
pub fn record_execution(action: TradeAction, result: &ExecutionResult) {
    let outcome = match &result.failure {
        None if result.success => "success",
        Some(FailureKind::CircuitBreaker(_)) => "blocked",
        Some(FailureKind::Quarantined) => "quarantined",
        Some(FailureKind::RollbackFailed) => "rollback_failed",
        Some(FailureKind::PartialClose) => "partial",
        _ => "failed",
    };
    ::metrics::counter!("funding_arb_executions_total", 1, "action" => action.to_string(), "outcome" => outcome);
    if result.filled_notional > 0.0 {
        ::metrics::counter!(
            "funding_arb_volume_usd_total",
            result.filled_notional.round() as u64,
            "action" => action.to_string()
        );
    }
}

/// A circuit breaker trip
pub fn record_breaker_trip(trip: &BreakerTrip) {
    ::metrics::counter!("funding_arb_breaker_trips_total", 1, "breaker" => trip.name());
}

/// A compensating order after a failed second leg
pub fn record_rollback(success: bool) {
    ::metrics::counter!("funding_arb_rollbacks_total", 1, "result" => result_label(success));
}

/// Symbols currently quarantined
pub fn set_quarantined(count: usize) {
    ::metrics::gauge!("funding_arb_quarantined_symbols", count as f64);
}

/// Pairs currently held and their summed per-leg notional
pub fn set_positions(active: usize, notional_usd: f64) {
    ::metrics::gauge!("funding_arb_active_positions", active as f64);
    ::metrics::gauge!("funding_arb_position_notional_usd", notional_usd);
}

/// Latest annualized spread of a symbol
pub fn set_spread(symbol: &str, annualized_pct: f64) {
    ::metrics::gauge!("funding_arb_annualized_spread_pct", annualized_pct, "symbol" => symbol.to_string());
}

fn result_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}
