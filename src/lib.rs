//! Funding-Rate Arbitrage Engine
//!
//! A delta-neutral arbitrage system that watches the funding rates of the same
//! perpetual contracts on two exchanges, holds equal-and-opposite positions to
//! collect the funding differential, and rotates those pairs to generate volume
//! without taking directional risk.

#![cfg_attr(not(test), deny(missing_docs))]
#![warn(clippy::all)]

pub mod config;
pub mod connectors;
pub mod data;
pub mod strategy;
pub mod trading;
pub mod utils;

// Re-export commonly used types
pub use config::ArbitrageConfig;
pub use connectors::{Exchange, ExchangeAdapter, VenuePair};
pub use data::{DataAggregator, MarketSnapshot, Spread};
pub use strategy::{ArbitrageEngine, Decision, DecisionPolicy};
pub use trading::{ArbPosition, Executor, PositionManager};

/// Result type used throughout the application
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the arbitrage system
#[derive(thiserror::Error, Debug)]
pub enum ArbitrageError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error (connect failure, TLS, reset)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Request exceeded its deadline
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Exchange answered with a non-success HTTP status
    #[error("Exchange error (HTTP {status}): {message}")]
    Exchange {
        /// HTTP status code
        status: u16,
        /// Response body or exchange message
        message: String,
    },

    /// Exchange answered successfully at the HTTP level with an error code
    #[error("Exchange API error (code {code}): {message}")]
    Api {
        /// Venue-specific error code
        code: i64,
        /// Exchange message
        message: String,
    },

    /// Data parsing error
    #[error("Data parsing error: {0}")]
    DataParsing(String),

    /// Exchange-side validation rejected an order
    #[error("Order rejected: {0}")]
    RejectedOrder(String),

    /// An advisory decision failed sanity checks
    #[error("Validation error: {0}")]
    Validation(String),

    /// No funding data could be collected for any symbol this cycle
    #[error("No funding data available for any symbol")]
    NoMarketData,

    /// The first leg of an open could not be unwound after the second failed
    #[error("Rollback failed for {symbol}: {message}")]
    RollbackFailure {
        /// Affected symbol
        symbol: String,
        /// Failure detail
        message: String,
    },

    /// Trading error
    #[error("Trading error: {0}")]
    Trading(String),
}

impl ArbitrageError {
    /// Whether the failure is worth retrying at the adapter boundary
    pub fn is_transient(&self) -> bool {
        match self {
            ArbitrageError::Connection(_) | ArbitrageError::Timeout(_) => true,
            ArbitrageError::Exchange { status, .. } => *status >= 500 || *status == 429,
            // Bybit rate limit and internal server errors
            ArbitrageError::Api { code, .. } => matches!(code, 10006 | 10016),
            _ => false,
        }
    }
}

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
