//! Two-leg execution with circuit breakers and rollback
//!
//! The executor is the only component that sends orders. Every open places
//! the short leg first; if the long leg then fails, the short leg is unwound
//! and the venue must report it flat. A failed unwind quarantines the symbol.

use super::{ArbPosition, BreakerTrip, CircuitBreakers, DryRunLedger, TradeAction};
use crate::{
    config::ArbitrageConfig,
    connectors::{Exchange, ExecutionResult, FailureKind, Position, PositionSide, VenuePair},
    data::MarketSnapshot,
    log_execution, log_risk,
    utils::metrics,
    ArbitrageError,
};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of a close-then-open rotation
#[derive(Debug, Clone, PartialEq)]
pub struct RotationResult {
    /// Close half (or the breaker that blocked the rotation)
    pub close: ExecutionResult,
    /// Open half; `None` when the close half did not complete
    pub open: Option<ExecutionResult>,
}

impl RotationResult {
    /// Both halves succeeded
    pub fn success(&self) -> bool {
        self.close.success && self.open.as_ref().map_or(false, |o| o.success)
    }

    /// Notional filled by both halves
    pub fn filled_notional(&self) -> f64 {
        self.close.filled_notional + self.open.as_ref().map_or(0.0, |o| o.filled_notional)
    }

    /// Single result describing the rotation
    pub fn summary(&self) -> ExecutionResult {
        match &self.open {
            Some(open) => ExecutionResult {
                filled_notional: self.filled_notional(),
                ..open.clone()
            },
            None => self.close.clone(),
        }
    }
}

/// Places orders for two-leg actions
pub struct Executor {
    venues: VenuePair,
    config: Arc<ArbitrageConfig>,
    breakers: CircuitBreakers,
    quarantine: DashMap<String, String>,
    ledger: Option<Arc<DryRunLedger>>,
}

impl Executor {
    /// Create an executor; with a ledger every order is simulated
    pub fn new(venues: VenuePair, config: Arc<ArbitrageConfig>, ledger: Option<Arc<DryRunLedger>>) -> Self {
        let breakers = CircuitBreakers::from_config(&config);
        Self {
            venues,
            config,
            breakers,
            quarantine: DashMap::new(),
            ledger,
        }
    }

    /// Whether orders are simulated
    pub fn is_dry_run(&self) -> bool {
        self.ledger.is_some()
    }

    /// Failures since the last successful execution
    pub fn consecutive_failures(&self) -> u32 {
        self.breakers.consecutive_failures()
    }

    /// Re-arm a tripped failure breaker after manual review
    pub fn reset_failures(&self) {
        let cleared = self.breakers.reset_failures();
        if cleared > 0 {
            info!("Failure streak of {} reset", cleared);
        }
    }

    /// Run the breakers for an action without trading
    pub fn check_breakers(&self, action: TradeAction, snapshot: &MarketSnapshot, symbol: &str) -> Option<BreakerTrip> {
        self.breakers.check(action, snapshot, symbol)
    }

    /// Whether a symbol is excluded pending manual intervention
    pub fn is_quarantined(&self, symbol: &str) -> bool {
        self.quarantine.contains_key(symbol)
    }

    /// Quarantined symbols and the reason for each
    pub fn quarantined(&self) -> Vec<(String, String)> {
        self.quarantine
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Exclude a symbol from automated trading
    pub fn quarantine(&self, symbol: &str, reason: impl Into<String>) {
        let reason = reason.into();
        error!(symbol = %symbol, "Symbol quarantined, manual intervention required: {}", reason);
        self.quarantine.insert(symbol.to_string(), reason);
        metrics::set_quarantined(self.quarantine.len());
    }

    /// Re-admit a quarantined symbol; returns whether it was quarantined
    pub fn clear_quarantine(&self, symbol: &str) -> bool {
        let cleared = self.quarantine.remove(symbol).is_some();
        if cleared {
            info!(symbol = %symbol, "Quarantine cleared");
            metrics::set_quarantined(self.quarantine.len());
        }
        cleared
    }

    /// Open a pair of `requested_usd` per leg, capped by the balance-derived size
    pub async fn open(&self, snapshot: &MarketSnapshot, symbol: &str, requested_usd: f64) -> ExecutionResult {
        if let Some(refused) = self.preflight(TradeAction::Open, snapshot, symbol) {
            return refused;
        }
        let Some(spread) = snapshot.spread(symbol) else {
            return ExecutionResult::failed(FailureKind::MissingData, format!("no spread for {}", symbol));
        };
        let size = requested_usd.min(snapshot.max_position_size.unwrap_or(0.0));

        let result = self
            .execute_open(symbol, spread.short_exchange, spread.long_exchange, size)
            .await;
        log_execution!(
            info,
            TradeAction::Open,
            symbol,
            result.success,
            cycle = snapshot.cycle,
            filled = result.filled_notional,
            "Execution finished"
        );
        metrics::record_execution(TradeAction::Open, &result);
        result
    }

    /// Close both legs of a pair
    pub async fn close(&self, snapshot: &MarketSnapshot, position: &ArbPosition) -> ExecutionResult {
        if let Some(refused) = self.preflight(TradeAction::Close, snapshot, &position.symbol) {
            return refused;
        }

        let result = self.execute_close(position).await;
        log_execution!(
            info,
            TradeAction::Close,
            position.symbol,
            result.success,
            cycle = snapshot.cycle,
            filled = result.filled_notional,
            "Execution finished"
        );
        metrics::record_execution(TradeAction::Close, &result);
        result
    }

    /// Close `position`, then open `target_symbol` at `size_usd`.
    ///
    /// The close half passes the close breakers for the held symbol. The open
    /// half re-runs the open breakers and takes its direction from the
    /// current spread, so a reversed differential flips the legs.
    pub async fn rotate(
        &self,
        snapshot: &MarketSnapshot,
        position: &ArbPosition,
        target_symbol: &str,
        size_usd: f64,
    ) -> RotationResult {
        let refused = self
            .preflight(TradeAction::Close, snapshot, &position.symbol)
            .or_else(|| self.preflight(TradeAction::Rotate, snapshot, target_symbol));
        if let Some(refused) = refused {
            return RotationResult { close: refused, open: None };
        }

        let close = self.execute_close(position).await;
        metrics::record_execution(TradeAction::Close, &close);
        if !close.success {
            warn!(symbol = %position.symbol, "Rotation stopped after failed close: {:?}", close.error);
            return RotationResult { close, open: None };
        }

        let open = self.open(snapshot, target_symbol, size_usd).await;
        let result = RotationResult { close, open: Some(open) };
        log_execution!(
            info,
            TradeAction::Rotate,
            target_symbol,
            result.success(),
            cycle = snapshot.cycle,
            from = %position.symbol,
            filled = result.filled_notional(),
            "Rotation finished"
        );
        result
    }

    /// Reduce-only close of a single unpaired leg
    pub async fn close_orphan(&self, exchange: Exchange, symbol: &str) -> ExecutionResult {
        if let Some(refused) = self.refuse_quarantined(symbol) {
            return refused;
        }
        let Some(adapter) = self.venues.get(exchange) else {
            return ExecutionResult::failed(FailureKind::MissingData, format!("{} is not a configured venue", exchange));
        };

        let result = adapter.close_position(symbol).await;
        if result.success {
            info!(symbol = %symbol, exchange = %exchange, "Orphaned leg closed");
        } else {
            warn!(symbol = %symbol, exchange = %exchange, "Failed to close orphaned leg: {:?}", result.error);
        }
        self.settle(&result);
        result
    }

    fn refuse_quarantined(&self, symbol: &str) -> Option<ExecutionResult> {
        let reason = self.quarantine.get(symbol)?;
        Some(ExecutionResult::failed(
            FailureKind::Quarantined,
            format!("{} is quarantined: {}", symbol, reason.value()),
        ))
    }

    fn preflight(&self, action: TradeAction, snapshot: &MarketSnapshot, symbol: &str) -> Option<ExecutionResult> {
        if let Some(refused) = self.refuse_quarantined(symbol) {
            return Some(refused);
        }
        let trip = self.breakers.check(action, snapshot, symbol)?;
        log_risk!(warn, trip.name(), action, symbol, cycle = snapshot.cycle, "Circuit breaker tripped: {}", trip);
        metrics::record_breaker_trip(&trip);
        Some(ExecutionResult::blocked(trip))
    }

    /// Track the failure streak for an execution that sent orders
    fn settle(&self, result: &ExecutionResult) {
        if result.success {
            self.breakers.record_success();
        } else {
            let streak = self.breakers.record_failure();
            warn!("Execution failed ({} consecutive)", streak);
        }
    }

    async fn place(
        &self,
        exchange: Exchange,
        symbol: &str,
        side: PositionSide,
        size_usd: f64,
        reduce_only: bool,
    ) -> ExecutionResult {
        if let Some(ledger) = &self.ledger {
            return ledger.fill(exchange, symbol, side, size_usd, reduce_only).await;
        }
        match self.venues.get(exchange) {
            Some(adapter) => adapter.open_position(symbol, side, size_usd, reduce_only).await,
            None => ExecutionResult::failed(FailureKind::MissingData, format!("{} is not a configured venue", exchange)),
        }
    }

    async fn close_leg(&self, exchange: Exchange, symbol: &str, side: PositionSide, notional: f64) -> ExecutionResult {
        if self.ledger.is_some() {
            return self.place(exchange, symbol, side.opposite(), notional, true).await;
        }
        match self.venues.get(exchange) {
            Some(adapter) => adapter.close_position(symbol).await,
            None => ExecutionResult::failed(FailureKind::MissingData, format!("{} is not a configured venue", exchange)),
        }
    }

    /// Flatten the short leg of a half-open pair.
    ///
    /// Live venues close the held quantity rather than re-converting the
    /// filled notional at a fresh mark, and the unwind only counts once the
    /// venue reports no position left on the symbol.
    async fn unwind_short(&self, exchange: Exchange, symbol: &str, filled_notional: f64) -> ExecutionResult {
        if self.ledger.is_some() {
            return self.place(exchange, symbol, PositionSide::Long, filled_notional, true).await;
        }
        let Some(adapter) = self.venues.get(exchange) else {
            return ExecutionResult::failed(FailureKind::MissingData, format!("{} is not a configured venue", exchange));
        };

        let unwind = adapter.close_position(symbol).await;
        if !unwind.success {
            return unwind;
        }
        match adapter.get_all_positions().await {
            Some(positions) => match positions.iter().find(|p| p.symbol == symbol && p.size > 0.0) {
                None => unwind,
                Some(remaining) => ExecutionResult {
                    success: false,
                    filled_notional: unwind.filled_notional,
                    error: Some(format!(
                        "{} {} still open on {} after unwind",
                        remaining.size, symbol, exchange
                    )),
                    failure: Some(FailureKind::RollbackFailed),
                    ..Default::default()
                },
            },
            None => ExecutionResult {
                success: false,
                filled_notional: unwind.filled_notional,
                error: Some(format!("positions on {} unknown after unwind", exchange)),
                failure: Some(FailureKind::RollbackFailed),
                ..Default::default()
            },
        }
    }

    async fn execute_open(
        &self,
        symbol: &str,
        short_exchange: Exchange,
        long_exchange: Exchange,
        size_usd: f64,
    ) -> ExecutionResult {
        let (exchange_a, _) = self.venues.exchanges();

        let short_leg = self.place(short_exchange, symbol, PositionSide::Short, size_usd, false).await;
        if !short_leg.success {
            let result = ExecutionResult {
                error: Some(format!(
                    "short leg on {} failed: {}",
                    short_exchange,
                    short_leg.error.as_deref().unwrap_or("unknown error")
                )),
                failure: Some(FailureKind::Rejected),
                ..Default::default()
            };
            self.settle(&result);
            return result;
        }

        let long_leg = self.place(long_exchange, symbol, PositionSide::Long, size_usd, false).await;
        let (order_id_a, order_id_b) = if short_exchange == exchange_a {
            (short_leg.order_id_a.clone(), long_leg.order_id_a.clone())
        } else {
            (long_leg.order_id_a.clone(), short_leg.order_id_a.clone())
        };

        if long_leg.success {
            let result = ExecutionResult {
                success: true,
                order_id_a,
                order_id_b,
                filled_notional: short_leg.filled_notional + long_leg.filled_notional,
                ..Default::default()
            };
            self.settle(&result);
            return result;
        }

        let leg_error = long_leg.error.clone().unwrap_or_else(|| "unknown error".to_string());
        warn!(
            symbol = %symbol,
            "Long leg on {} failed ({}); unwinding short leg on {}",
            long_exchange, leg_error, short_exchange
        );
        let compensation = self.unwind_short(short_exchange, symbol, short_leg.filled_notional).await;
        metrics::record_rollback(compensation.success);

        let result = if compensation.success {
            ExecutionResult {
                success: false,
                order_id_a,
                order_id_b,
                filled_notional: short_leg.filled_notional + compensation.filled_notional,
                error: Some(format!("long leg on {} failed: {}; short leg unwound", long_exchange, leg_error)),
                rolled_back: true,
                failure: Some(FailureKind::Rejected),
            }
        } else {
            let failure = ArbitrageError::RollbackFailure {
                symbol: symbol.to_string(),
                message: format!(
                    "long leg on {} failed ({}) and the short leg on {} could not be unwound: {}",
                    long_exchange,
                    leg_error,
                    short_exchange,
                    compensation.error.as_deref().unwrap_or("unknown error")
                ),
            };
            error!("{}", failure);
            self.quarantine(symbol, failure.to_string());
            ExecutionResult {
                success: false,
                order_id_a,
                order_id_b,
                filled_notional: short_leg.filled_notional,
                error: Some(failure.to_string()),
                rolled_back: false,
                failure: Some(FailureKind::RollbackFailed),
            }
        };
        self.settle(&result);
        result
    }

    async fn execute_close(&self, position: &ArbPosition) -> ExecutionResult {
        let symbol = position.symbol.as_str();
        let (exchange_a, _) = self.venues.exchanges();
        let notional = position.target_notional_usd;

        let (long_leg, short_leg) = tokio::join!(
            self.close_leg(position.long_exchange(), symbol, PositionSide::Long, self.leg_notional(&position.long, notional)),
            self.close_leg(position.short_exchange(), symbol, PositionSide::Short, self.leg_notional(&position.short, notional))
        );

        let (order_id_a, order_id_b) = if position.long_exchange() == exchange_a {
            (long_leg.order_id_a.clone(), short_leg.order_id_a.clone())
        } else {
            (short_leg.order_id_a.clone(), long_leg.order_id_a.clone())
        };
        let filled_notional = long_leg.filled_notional + short_leg.filled_notional;

        let result = match (long_leg.success, short_leg.success) {
            (true, true) => ExecutionResult {
                success: true,
                order_id_a,
                order_id_b,
                filled_notional,
                ..Default::default()
            },
            (true, false) | (false, true) => {
                let (failed_exchange, failed) = if long_leg.success {
                    (position.short_exchange(), &short_leg)
                } else {
                    (position.long_exchange(), &long_leg)
                };
                ExecutionResult {
                    success: false,
                    order_id_a,
                    order_id_b,
                    filled_notional,
                    error: Some(format!(
                        "partial close of {}: leg on {} failed: {}",
                        symbol,
                        failed_exchange,
                        failed.error.as_deref().unwrap_or("unknown error")
                    )),
                    rolled_back: false,
                    failure: Some(FailureKind::PartialClose),
                }
            }
            (false, false) => ExecutionResult {
                error: Some(format!(
                    "close of {} failed on both venues: {} / {}",
                    symbol,
                    long_leg.error.as_deref().unwrap_or("unknown error"),
                    short_leg.error.as_deref().unwrap_or("unknown error")
                )),
                failure: Some(FailureKind::Rejected),
                ..Default::default()
            },
        };
        self.settle(&result);
        result
    }

    /// Simulated legs close at the notional they were opened with
    fn leg_notional(&self, leg: &Position, target: f64) -> f64 {
        if self.ledger.is_some() {
            target
        } else {
            leg.notional_value()
        }
    }

    /// Configuration the executor was built with
    pub fn config(&self) -> &ArbitrageConfig {
        &self.config
    }
}
