//! Paired delta-neutral positions

use crate::{
    connectors::{Exchange, Position, PositionSide},
    ArbitrageError, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a symbol's pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolState {
    /// No pair held
    Closed,
    /// Two-leg open in flight
    Opening,
    /// Pair held
    Open,
    /// Close-then-open in flight
    Rotating,
    /// Two-leg close in flight
    Closing,
    /// Excluded from trading until cleared
    Quarantined,
}

impl SymbolState {
    /// States that must never outlive a cycle
    pub fn is_transient(self) -> bool {
        matches!(self, SymbolState::Opening | SymbolState::Rotating | SymbolState::Closing)
    }
}

impl fmt::Display for SymbolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SymbolState::Closed => "CLOSED",
            SymbolState::Opening => "OPENING",
            SymbolState::Open => "OPEN",
            SymbolState::Rotating => "ROTATING",
            SymbolState::Closing => "CLOSING",
            SymbolState::Quarantined => "QUARANTINED",
        };
        write!(f, "{}", name)
    }
}

/// One long and one short leg of the same symbol on two venues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbPosition {
    /// Canonical symbol
    pub symbol: String,
    /// Long leg
    pub long: Position,
    /// Short leg
    pub short: Position,
    /// Per-leg notional requested at open
    pub target_notional_usd: f64,
    /// When the pair was opened
    pub opened_at: DateTime<Utc>,
    /// Last volume rotation
    pub last_rotated_at: Option<DateTime<Utc>>,
    /// Next scheduled volume rotation
    pub next_rotation_at: DateTime<Utc>,
}

impl ArbPosition {
    /// Pair two legs, checking they form a valid hedge
    pub fn new(
        long: Position,
        short: Position,
        target_notional_usd: f64,
        opened_at: DateTime<Utc>,
        next_rotation_at: DateTime<Utc>,
    ) -> Result<Self> {
        if long.symbol != short.symbol {
            return Err(ArbitrageError::Trading(format!(
                "Legs disagree on symbol: {} vs {}",
                long.symbol, short.symbol
            ))
            .into());
        }
        if long.exchange == short.exchange {
            return Err(ArbitrageError::Trading(format!(
                "Both legs of {} are on {}",
                long.symbol, long.exchange
            ))
            .into());
        }
        if long.side != PositionSide::Long || short.side != PositionSide::Short {
            return Err(ArbitrageError::Trading(format!(
                "Legs of {} are not one long and one short",
                long.symbol
            ))
            .into());
        }

        Ok(Self {
            symbol: long.symbol.clone(),
            long,
            short,
            target_notional_usd,
            opened_at,
            last_rotated_at: None,
            next_rotation_at,
        })
    }

    /// Pair built from fill notionals at known marks
    #[allow(clippy::too_many_arguments)]
    pub fn from_fills(
        symbol: &str,
        long_exchange: Exchange,
        long_mark: f64,
        short_exchange: Exchange,
        short_mark: f64,
        notional_per_leg: f64,
        opened_at: DateTime<Utc>,
        next_rotation_at: DateTime<Utc>,
    ) -> Result<Self> {
        if long_mark <= 0.0 || short_mark <= 0.0 {
            return Err(ArbitrageError::Trading(format!("No mark price to size {} legs", symbol)).into());
        }
        let leg = |exchange, side, mark: f64| Position {
            symbol: symbol.to_string(),
            exchange,
            side,
            size: notional_per_leg / mark,
            entry_price: mark,
            mark_price: mark,
            unrealized_pnl: 0.0,
        };
        Self::new(
            leg(long_exchange, PositionSide::Long, long_mark),
            leg(short_exchange, PositionSide::Short, short_mark),
            notional_per_leg,
            opened_at,
            next_rotation_at,
        )
    }

    /// `long.notional - short.notional`
    pub fn delta_imbalance(&self) -> f64 {
        self.long.notional_value() - self.short.notional_value()
    }

    /// Sum of both legs' notional
    pub fn total_notional(&self) -> f64 {
        self.long.notional_value() + self.short.notional_value()
    }

    /// `|delta| / total`, zero for an empty pair
    pub fn imbalance_ratio(&self) -> f64 {
        let total = self.total_notional();
        if total > 0.0 {
            self.delta_imbalance().abs() / total
        } else {
            0.0
        }
    }

    /// Whether the imbalance ratio is strictly inside `tolerance`
    pub fn is_balanced(&self, tolerance: f64) -> bool {
        self.imbalance_ratio() < tolerance
    }

    /// Venue holding the short leg
    pub fn short_exchange(&self) -> Exchange {
        self.short.exchange
    }

    /// Venue holding the long leg
    pub fn long_exchange(&self) -> Exchange {
        self.long.exchange
    }

    /// Side held on a venue
    pub fn side_on(&self, exchange: Exchange) -> Option<PositionSide> {
        if exchange == self.long.exchange {
            Some(PositionSide::Long)
        } else if exchange == self.short.exchange {
            Some(PositionSide::Short)
        } else {
            None
        }
    }

    /// Update leg marks and unrealized PnL
    pub fn refresh_marks(&mut self, long_mark: Option<f64>, short_mark: Option<f64>) {
        if let Some(mark) = long_mark {
            self.long.mark_price = mark;
            self.long.unrealized_pnl = (mark - self.long.entry_price) * self.long.size;
        }
        if let Some(mark) = short_mark {
            self.short.mark_price = mark;
            self.short.unrealized_pnl = (self.short.entry_price - mark) * self.short.size;
        }
    }

    /// Combined unrealized PnL of both legs
    pub fn unrealized_pnl(&self) -> f64 {
        self.long.unrealized_pnl + self.short.unrealized_pnl
    }
}
