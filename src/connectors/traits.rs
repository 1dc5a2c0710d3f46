//! Exchange adapter trait and the normalized types it exchanges

use super::Exchange;
use crate::trading::BreakerTrip;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability set every venue implementation provides.
///
/// Nothing here returns an error: a failed read is `None` and means
/// "unknown", never zero; a failed write is an unsuccessful
/// [`ExecutionResult`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Which exchange this adapter talks to
    fn exchange(&self) -> Exchange;

    /// Load venue metadata (lot sizes) and verify connectivity
    async fn initialize(&self) -> bool;

    /// Release resources held by the adapter
    async fn close(&self);

    /// Current funding quote for a canonical symbol
    async fn get_funding_info(&self, symbol: &str) -> Option<FundingQuote>;

    /// Current mark price for a canonical symbol
    async fn get_mark_price(&self, symbol: &str) -> Option<f64>;

    /// Account balance in the quote asset
    async fn get_balance(&self) -> Option<AccountBalance>;

    /// Open position for a symbol; `None` when flat or unknown
    async fn get_position(&self, symbol: &str) -> Option<Position>;

    /// All open positions; `None` when the venue could not be read
    async fn get_all_positions(&self) -> Option<Vec<Position>>;

    /// Market order for `size_usd` notional on `side`
    async fn open_position(
        &self,
        symbol: &str,
        side: PositionSide,
        size_usd: f64,
        reduce_only: bool,
    ) -> ExecutionResult;

    /// Flatten the position on a symbol with a reduce-only order
    async fn close_position(&self, symbol: &str) -> ExecutionResult;

    /// Move the position on a symbol to `target_size_usd` on `target_side`
    async fn adjust_position(
        &self,
        symbol: &str,
        target_size_usd: f64,
        target_side: PositionSide,
    ) -> ExecutionResult;

    /// Canonical symbol (`BTC`) to venue symbol (`BTCUSDT`)
    fn to_exchange_symbol(&self, symbol: &str) -> String;

    /// Venue symbol (`BTCUSDT`) to canonical symbol (`BTC`)
    fn from_exchange_symbol(&self, exchange_symbol: &str) -> String;
}

/// Direction of a perpetual position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    /// Long position
    Long,
    /// Short position
    Short,
}

impl PositionSide {
    /// The other side
    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Direction of the funding rate relative to the previous observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingTrend {
    /// Rate went up
    Rising,
    /// Rate went down
    Falling,
    /// Unchanged, or no previous observation
    Stable,
}

impl FundingTrend {
    /// Classify the move from `previous` to `current`
    pub fn between(previous: Option<f64>, current: f64) -> Self {
        const EPSILON: f64 = 1e-9;
        match previous {
            Some(prev) if current - prev > EPSILON => FundingTrend::Rising,
            Some(prev) if prev - current > EPSILON => FundingTrend::Falling,
            _ => FundingTrend::Stable,
        }
    }
}

/// Funding information for one symbol on one venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingQuote {
    /// Canonical symbol
    pub symbol: String,
    /// Venue
    pub exchange: Exchange,
    /// Funding rate per settlement period (0.0001 = 0.01%)
    pub rate: f64,
    /// Rate scaled to a yearly percentage
    pub annualized_rate: f64,
    /// Mark price
    pub mark_price: f64,
    /// Next settlement, when the venue reports it
    pub next_settlement_time: Option<DateTime<Utc>>,
    /// Direction versus the previous cycle
    pub trend: FundingTrend,
}

impl FundingQuote {
    /// Build a quote, annualizing with `periods_per_year`
    pub fn new(
        symbol: impl Into<String>,
        exchange: Exchange,
        rate: f64,
        mark_price: f64,
        next_settlement_time: Option<DateTime<Utc>>,
        periods_per_year: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            exchange,
            rate,
            annualized_rate: crate::data::annualize(rate, periods_per_year),
            mark_price,
            next_settlement_time,
            trend: FundingTrend::Stable,
        }
    }
}

/// A single-venue position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Canonical symbol
    pub symbol: String,
    /// Venue
    pub exchange: Exchange,
    /// Direction
    pub side: PositionSide,
    /// Size in base units, never negative
    pub size: f64,
    /// Average entry price
    pub entry_price: f64,
    /// Current mark price
    pub mark_price: f64,
    /// Unrealized PnL in the quote asset
    pub unrealized_pnl: f64,
}

impl Position {
    /// USD exposure at the mark price
    pub fn notional_value(&self) -> f64 {
        self.size * self.mark_price
    }
}

/// Account balance on one venue
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Total equity
    pub equity: f64,
    /// Balance free for new margin
    pub available_balance: f64,
    /// Margin locked by positions and orders
    pub margin_used: f64,
}

/// Typed reason attached to an unsuccessful [`ExecutionResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureKind {
    /// A pre-trade check blocked the action; no order was sent
    CircuitBreaker(BreakerTrip),
    /// The symbol traded too recently
    Cooldown,
    /// The exchange refused, or the request failed or timed out
    Rejected,
    /// One close leg succeeded and the other did not
    PartialClose,
    /// A first leg could not be unwound; manual intervention required
    RollbackFailed,
    /// The symbol is excluded pending manual intervention
    Quarantined,
    /// Data required for the action was unavailable
    MissingData,
}

/// Outcome of a single order or a two-leg execution.
///
/// For two-leg executions `order_id_a`/`order_id_b` follow the engine's
/// exchange A/B order; single-venue results only use `order_id_a`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the action completed as requested
    pub success: bool,
    /// Order on exchange A
    pub order_id_a: Option<String>,
    /// Order on exchange B
    pub order_id_b: Option<String>,
    /// USD notional filled across all legs
    pub filled_notional: f64,
    /// Human-readable failure description
    pub error: Option<String>,
    /// A first leg was unwound after a second-leg failure
    pub rolled_back: bool,
    /// Typed failure reason
    pub failure: Option<FailureKind>,
}

impl ExecutionResult {
    /// A filled single-venue order
    pub fn filled(order_id: impl Into<String>, filled_notional: f64) -> Self {
        Self {
            success: true,
            order_id_a: Some(order_id.into()),
            filled_notional,
            ..Default::default()
        }
    }

    /// Success with nothing to do (e.g. closing a flat position)
    pub fn noop() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// A rejected or failed order
    pub fn rejected(error: impl Into<String>) -> Self {
        Self::failed(FailureKind::Rejected, error)
    }

    /// A failure of the given kind
    pub fn failed(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            failure: Some(kind),
            ..Default::default()
        }
    }

    /// A circuit breaker blocked the action
    pub fn blocked(trip: BreakerTrip) -> Self {
        let message = trip.to_string();
        Self::failed(FailureKind::CircuitBreaker(trip), message)
    }

    /// Whether a circuit breaker blocked the action
    pub fn is_blocked(&self) -> bool {
        matches!(self.failure, Some(FailureKind::CircuitBreaker(_)))
    }
}

/// One order in an adjustment plan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustmentStep {
    /// Order side as a position direction (Long = buy, Short = sell)
    pub side: PositionSide,
    /// Notional of the order
    pub size_usd: f64,
    /// Whether the order may only reduce exposure
    pub reduce_only: bool,
}

/// Orders needed to move `current` to `target_size_usd` on `target_side`.
///
/// Shrinking uses a reduce-only order, growing a plain one, and switching
/// sides closes the old position before opening the new one. Differences
/// below `min_step_usd` are ignored.
pub fn plan_adjustment(
    current: Option<&Position>,
    mark_price: f64,
    target_size_usd: f64,
    target_side: PositionSide,
    min_step_usd: f64,
) -> Vec<AdjustmentStep> {
    let target = target_size_usd.max(0.0);
    let (current_side, current_usd) = match current {
        Some(p) if p.size > 0.0 => (Some(p.side), p.size * mark_price),
        _ => (None, 0.0),
    };

    let mut steps = Vec::new();
    match current_side {
        None => {
            if target >= min_step_usd {
                steps.push(AdjustmentStep { side: target_side, size_usd: target, reduce_only: false });
            }
        }
        Some(side) if side == target_side => {
            let delta = target - current_usd;
            if delta.abs() >= min_step_usd {
                if delta > 0.0 {
                    steps.push(AdjustmentStep { side, size_usd: delta, reduce_only: false });
                } else {
                    steps.push(AdjustmentStep {
                        side: side.opposite(),
                        size_usd: -delta,
                        reduce_only: true,
                    });
                }
            }
        }
        Some(side) => {
            steps.push(AdjustmentStep {
                side: side.opposite(),
                size_usd: current_usd,
                reduce_only: true,
            });
            if target >= min_step_usd {
                steps.push(AdjustmentStep { side: target_side, size_usd: target, reduce_only: false });
            }
        }
    }
    steps
}

/// Drive an adapter through [`plan_adjustment`].
///
/// Venues share this: it reads the current position and mark, then sends
/// the planned orders in sequence and stops at the first failure.
pub async fn execute_adjustment<A: ExchangeAdapter + ?Sized>(
    adapter: &A,
    symbol: &str,
    target_size_usd: f64,
    target_side: PositionSide,
    min_step_usd: f64,
) -> ExecutionResult {
    let Some(positions) = adapter.get_all_positions().await else {
        return ExecutionResult::failed(FailureKind::MissingData, "positions unavailable");
    };
    let Some(mark) = adapter.get_mark_price(symbol).await else {
        return ExecutionResult::failed(FailureKind::MissingData, "mark price unavailable");
    };
    let current = positions.iter().find(|p| p.symbol == symbol);

    let mut filled = 0.0;
    let mut order_id = None;
    for step in plan_adjustment(current, mark, target_size_usd, target_side, min_step_usd) {
        let fully_closes = step.reduce_only
            && current.map_or(false, |p| step.size_usd >= p.size * mark - f64::EPSILON);
        let result = if fully_closes {
            adapter.close_position(symbol).await
        } else {
            adapter
                .open_position(symbol, step.side, step.size_usd, step.reduce_only)
                .await
        };
        if !result.success {
            return ExecutionResult {
                filled_notional: filled + result.filled_notional,
                ..result
            };
        }
        filled += result.filled_notional;
        order_id = result.order_id_a.or(order_id);
    }

    ExecutionResult {
        success: true,
        order_id_a: order_id,
        filled_notional: filled,
        ..Default::default()
    }
}
