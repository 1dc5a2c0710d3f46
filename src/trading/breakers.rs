//! Pre-trade circuit breakers

use crate::{config::ArbitrageConfig, data::MarketSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Kind of two-leg action being checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeAction {
    /// Open a new pair
    Open,
    /// Close a pair
    Close,
    /// Close and reopen a pair
    Rotate,
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Open => write!(f, "OPEN"),
            TradeAction::Close => write!(f, "CLOSE"),
            TradeAction::Rotate => write!(f, "ROTATE"),
        }
    }
}

/// Why a breaker blocked a trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BreakerTrip {
    /// Volatility unknown or at/above the ceiling
    Volatility {
        /// Symbol checked
        symbol: String,
        /// Measured volatility, if any
        volatility_pct: Option<f64>,
        /// Configured ceiling
        max_pct: f64,
    },
    /// Spread missing or below the open threshold
    Spread {
        /// Symbol checked
        symbol: String,
        /// Measured annualized spread, if any
        annualized_pct: Option<f64>,
        /// Configured threshold
        min_pct: f64,
    },
    /// Balance-derived size unknown or below the minimum
    Balance {
        /// Size the balances allow, if known
        available_usd: Option<f64>,
        /// Configured minimum
        min_usd: f64,
    },
    /// Too many consecutive failed executions
    Failure {
        /// Failures since the last success
        consecutive: u32,
        /// Configured limit
        max: u32,
    },
}

impl BreakerTrip {
    /// Short name of the breaker
    pub fn name(&self) -> &'static str {
        match self {
            BreakerTrip::Volatility { .. } => "volatility",
            BreakerTrip::Spread { .. } => "spread",
            BreakerTrip::Balance { .. } => "balance",
            BreakerTrip::Failure { .. } => "failure",
        }
    }
}

impl fmt::Display for BreakerTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerTrip::Volatility { symbol, volatility_pct: Some(v), max_pct } => {
                write!(f, "{} volatility {:.2}% >= {:.2}%", symbol, v, max_pct)
            }
            BreakerTrip::Volatility { symbol, volatility_pct: None, .. } => {
                write!(f, "{} volatility unknown", symbol)
            }
            BreakerTrip::Spread { symbol, annualized_pct: Some(s), min_pct } => {
                write!(f, "{} spread {:.2}% < {:.2}%", symbol, s, min_pct)
            }
            BreakerTrip::Spread { symbol, annualized_pct: None, .. } => {
                write!(f, "{} spread unavailable", symbol)
            }
            BreakerTrip::Balance { available_usd: Some(a), min_usd } => {
                write!(f, "available size ${:.2} < ${:.2}", a, min_usd)
            }
            BreakerTrip::Balance { available_usd: None, .. } => write!(f, "balances unknown"),
            BreakerTrip::Failure { consecutive, max } => {
                write!(f, "{} consecutive failures (limit {})", consecutive, max)
            }
        }
    }
}

/// Breaker thresholds plus the engine-wide failure counter
#[derive(Debug)]
pub struct CircuitBreakers {
    max_volatility_pct: f64,
    min_spread_pct: f64,
    min_position_usd: f64,
    max_consecutive_failures: u32,
    consecutive_failures: AtomicU32,
}

impl CircuitBreakers {
    /// Thresholds from configuration
    pub fn from_config(config: &ArbitrageConfig) -> Self {
        Self {
            max_volatility_pct: config.risk.max_volatility_pct,
            min_spread_pct: config.strategy.min_spread_threshold_pct,
            min_position_usd: config.risk.min_position_usd,
            max_consecutive_failures: config.risk.max_consecutive_failures,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Run the breakers in order; the first trip wins.
    ///
    /// Spread, balance and failure-streak checks only guard actions that
    /// open exposure; a close still needs safe volatility.
    pub fn check(&self, action: TradeAction, snapshot: &MarketSnapshot, symbol: &str) -> Option<BreakerTrip> {
        let volatility = snapshot.volatility_of(symbol);
        if !volatility.is_safe {
            return Some(BreakerTrip::Volatility {
                symbol: symbol.to_string(),
                volatility_pct: volatility.volatility_pct,
                max_pct: self.max_volatility_pct,
            });
        }

        if action != TradeAction::Close {
            let annualized = snapshot.spread(symbol).map(|s| s.annualized_spread);
            if annualized.map_or(true, |s| s < self.min_spread_pct) {
                return Some(BreakerTrip::Spread {
                    symbol: symbol.to_string(),
                    annualized_pct: annualized,
                    min_pct: self.min_spread_pct,
                });
            }

            if snapshot.max_position_size.map_or(true, |size| size < self.min_position_usd) {
                return Some(BreakerTrip::Balance {
                    available_usd: snapshot.max_position_size,
                    min_usd: self.min_position_usd,
                });
            }
        }

        let consecutive = self.consecutive_failures();
        if action != TradeAction::Close && consecutive >= self.max_consecutive_failures {
            return Some(BreakerTrip::Failure {
                consecutive,
                max: self.max_consecutive_failures,
            });
        }

        None
    }

    /// Failures since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Count a failed execution; returns the new streak
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reset the failure streak
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Operator reset of a tripped failure breaker; returns the cleared streak
    pub fn reset_failures(&self) -> u32 {
        self.consecutive_failures.swap(0, Ordering::SeqCst)
    }
}
