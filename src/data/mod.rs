//! Market data aggregation: funding spreads, volatility and account state

pub mod aggregator;
pub mod spread;
pub mod volatility;

pub use aggregator::*;
pub use spread::*;
pub use volatility::*;

/// Settlements per year for an 8-hour funding interval
pub const DEFAULT_PERIODS_PER_YEAR: f64 = 1095.0;

/// Scale a per-period rate to a yearly percentage
pub fn annualize(rate: f64, periods_per_year: f64) -> f64 {
    rate * periods_per_year * 100.0
}
