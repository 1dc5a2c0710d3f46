//! Funding spread between the two venues

use super::annualize;
use crate::connectors::{Exchange, FundingQuote, PositionSide};
use serde::{Deserialize, Serialize};

/// Funding differential for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    /// Canonical symbol
    pub symbol: String,
    /// Funding rate on exchange A
    pub rate_a: f64,
    /// Funding rate on exchange B
    pub rate_b: f64,
    /// `|rate_a - rate_b|`
    pub spread: f64,
    /// Spread as a yearly percentage
    pub annualized_spread: f64,
    /// Venue with the higher rate; shorts there receive funding
    pub short_exchange: Exchange,
    /// Venue with the lower rate
    pub long_exchange: Exchange,
}

impl Spread {
    /// Spread from raw rates. On equal rates exchange A is reported as short.
    pub fn from_rates(
        symbol: impl Into<String>,
        exchange_a: Exchange,
        rate_a: f64,
        exchange_b: Exchange,
        rate_b: f64,
        periods_per_year: f64,
    ) -> Self {
        let spread = (rate_a - rate_b).abs();
        let (short_exchange, long_exchange) = if rate_b > rate_a {
            (exchange_b, exchange_a)
        } else {
            (exchange_a, exchange_b)
        };

        Self {
            symbol: symbol.into(),
            rate_a,
            rate_b,
            spread,
            annualized_spread: annualize(spread, periods_per_year),
            short_exchange,
            long_exchange,
        }
    }

    /// Spread from the A and B quotes of the same symbol
    pub fn from_quotes(a: &FundingQuote, b: &FundingQuote, periods_per_year: f64) -> Option<Self> {
        if a.symbol != b.symbol || a.exchange == b.exchange {
            return None;
        }
        Some(Self::from_rates(
            a.symbol.clone(),
            a.exchange,
            a.rate,
            b.exchange,
            b.rate,
            periods_per_year,
        ))
    }

    /// Worth opening: non-zero and at least `min_threshold_pct` annualized
    pub fn is_viable(&self, min_threshold_pct: f64) -> bool {
        self.spread > 0.0 && self.annualized_spread >= min_threshold_pct
    }

    /// Side a pair should hold on `exchange`
    pub fn side_on(&self, exchange: Exchange) -> PositionSide {
        if exchange == self.short_exchange {
            PositionSide::Short
        } else {
            PositionSide::Long
        }
    }
}
