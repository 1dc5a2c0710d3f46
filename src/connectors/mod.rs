//! Exchange connector implementations

pub mod binance;
pub mod bybit;
pub mod rest;
pub mod sizing;
pub mod traits;

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use rest::{RequestThrottle, RestClient, RetryPolicy};
pub use sizing::LotSize;
pub use traits::*;

use crate::{config::ArbitrageConfig, ArbitrageError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Supported exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    /// Binance USDⓈ-M futures
    Binance,
    /// Bybit linear perpetuals
    Bybit,
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exchange::Binance => write!(f, "binance"),
            Exchange::Bybit => write!(f, "bybit"),
        }
    }
}

impl std::str::FromStr for Exchange {
    type Err = ArbitrageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "bybit" => Ok(Exchange::Bybit),
            _ => Err(ArbitrageError::Config(format!("Unknown exchange: {}", s))),
        }
    }
}

/// The two venues an engine trades, in "A then B" order.
///
/// Every component that talks to exchanges shares the same pair so that
/// "exchange A" means the same thing in spreads, decisions and results.
#[derive(Clone)]
pub struct VenuePair {
    a: Arc<dyn ExchangeAdapter>,
    b: Arc<dyn ExchangeAdapter>,
}

impl VenuePair {
    /// Pair two adapters; they must be different exchanges
    pub fn new(a: Arc<dyn ExchangeAdapter>, b: Arc<dyn ExchangeAdapter>) -> Result<Self> {
        if a.exchange() == b.exchange() {
            return Err(ArbitrageError::Config(format!(
                "Both venues are {}; two distinct exchanges are required",
                a.exchange()
            ))
            .into());
        }
        Ok(Self { a, b })
    }

    /// Exchange A adapter
    pub fn a(&self) -> &Arc<dyn ExchangeAdapter> {
        &self.a
    }

    /// Exchange B adapter
    pub fn b(&self) -> &Arc<dyn ExchangeAdapter> {
        &self.b
    }

    /// Identifiers of exchange A and B
    pub fn exchanges(&self) -> (Exchange, Exchange) {
        (self.a.exchange(), self.b.exchange())
    }

    /// Adapter for the given exchange, if it is part of the pair
    pub fn get(&self, exchange: Exchange) -> Option<&Arc<dyn ExchangeAdapter>> {
        if self.a.exchange() == exchange {
            Some(&self.a)
        } else if self.b.exchange() == exchange {
            Some(&self.b)
        } else {
            None
        }
    }

    /// The venue that is not `exchange`
    pub fn other(&self, exchange: Exchange) -> Exchange {
        if self.a.exchange() == exchange {
            self.b.exchange()
        } else {
            self.a.exchange()
        }
    }

    /// Both adapters, A first
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ExchangeAdapter>> {
        [&self.a, &self.b].into_iter()
    }
}

/// Connector factory for creating exchange adapters
pub struct ConnectorFactory;

impl ConnectorFactory {
    /// Create the adapter for one exchange with its own request throttle
    pub fn create_adapter(
        exchange: Exchange,
        config: &ArbitrageConfig,
    ) -> Result<Arc<dyn ExchangeAdapter>> {
        let throttle = Arc::new(RequestThrottle::per_second(config.execution.requests_per_second));
        let client = RestClient::new(
            config.exchanges.venue(exchange).base_url(),
            &config.execution,
            throttle,
        )?;
        let venue = config.exchanges.venue(exchange).clone();
        let quote = config.exchanges.quote_asset.clone();
        let periods = config.periods_per_year();

        let adapter: Arc<dyn ExchangeAdapter> = match exchange {
            Exchange::Binance => {
                Arc::new(BinanceAdapter::new(client, venue, quote).with_periods_per_year(periods))
            }
            Exchange::Bybit => {
                Arc::new(BybitAdapter::new(client, venue, quote).with_periods_per_year(periods))
            }
        };
        Ok(adapter)
    }

    /// Create the configured A/B venue pair
    pub fn create_pair(config: &ArbitrageConfig) -> Result<VenuePair> {
        let a = Self::create_adapter(config.exchanges.venue_a, config)?;
        let b = Self::create_adapter(config.exchanges.venue_b, config)?;
        VenuePair::new(a, b)
    }
}
