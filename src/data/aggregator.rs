//! Per-cycle market snapshot collection

use super::{annualize, PriceHistory, Spread, VolatilityReading};
use crate::{
    config::ArbitrageConfig,
    connectors::{AccountBalance, Exchange, ExchangeAdapter, FundingQuote, FundingTrend, Position, VenuePair},
    log_spread,
    trading::DryRunLedger,
    ArbitrageError, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Funding quotes of one symbol on both venues
#[derive(Debug, Clone, Default)]
pub struct QuotePair {
    /// Quote from exchange A
    pub a: Option<FundingQuote>,
    /// Quote from exchange B
    pub b: Option<FundingQuote>,
}

/// Immutable view of the market for one cycle.
///
/// Missing map entries mean "unknown", never zero.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    /// Cycle number
    pub cycle: u64,
    /// Collection time
    pub taken_at: DateTime<Utc>,
    /// Exchange A
    pub exchange_a: Exchange,
    /// Exchange B
    pub exchange_b: Exchange,
    /// Funding quotes per symbol
    pub quotes: IndexMap<String, QuotePair>,
    /// Spreads for symbols quoted on both venues
    pub spreads: IndexMap<String, Spread>,
    /// Mark prices per (symbol, venue), including fallback lookups
    pub marks: HashMap<(String, Exchange), f64>,
    /// Volatility per symbol
    pub volatility: HashMap<String, VolatilityReading>,
    /// Balances of venues that answered
    pub balances: HashMap<Exchange, AccountBalance>,
    /// Open positions of venues that answered
    pub positions: HashMap<Exchange, Vec<Position>>,
    /// Largest per-leg notional the balances allow
    pub max_position_size: Option<f64>,
}

impl MarketSnapshot {
    /// Empty snapshot
    pub fn new(cycle: u64, exchange_a: Exchange, exchange_b: Exchange, taken_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            taken_at,
            exchange_a,
            exchange_b,
            quotes: IndexMap::new(),
            spreads: IndexMap::new(),
            marks: HashMap::new(),
            volatility: HashMap::new(),
            balances: HashMap::new(),
            positions: HashMap::new(),
            max_position_size: None,
        }
    }

    /// Spread of a symbol
    pub fn spread(&self, symbol: &str) -> Option<&Spread> {
        self.spreads.get(symbol)
    }

    /// Volatility of a symbol, unknown when not sampled
    pub fn volatility_of(&self, symbol: &str) -> VolatilityReading {
        self.volatility
            .get(symbol)
            .copied()
            .unwrap_or_else(VolatilityReading::unknown)
    }

    /// Whether a symbol's volatility is known and below the ceiling
    pub fn is_safe(&self, symbol: &str) -> bool {
        self.volatility_of(symbol).is_safe
    }

    /// Mark price of a symbol on a venue
    pub fn mark_price(&self, symbol: &str, exchange: Exchange) -> Option<f64> {
        self.marks.get(&(symbol.to_string(), exchange)).copied()
    }

    /// Mark price on either venue, preferring exchange A
    pub fn any_mark_price(&self, symbol: &str) -> Option<f64> {
        self.mark_price(symbol, self.exchange_a)
            .or_else(|| self.mark_price(symbol, self.exchange_b))
    }

    /// Earliest known funding settlement of a symbol
    pub fn next_settlement(&self, symbol: &str) -> Option<DateTime<Utc>> {
        let pair = self.quotes.get(symbol)?;
        [pair.a.as_ref(), pair.b.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|q| q.next_settlement_time)
            .min()
    }

    /// Positions reported by a venue; `None` when the venue was not read
    pub fn positions_on(&self, exchange: Exchange) -> Option<&[Position]> {
        self.positions.get(&exchange).map(Vec::as_slice)
    }

    /// Insert both quotes of a symbol, deriving spread and marks
    pub fn insert_quotes(&mut self, a: FundingQuote, b: FundingQuote, periods_per_year: f64) {
        let symbol = a.symbol.clone();
        if let Some(spread) = Spread::from_quotes(&a, &b, periods_per_year) {
            self.spreads.insert(symbol.clone(), spread);
        }
        self.marks.insert((symbol.clone(), a.exchange), a.mark_price);
        self.marks.insert((symbol.clone(), b.exchange), b.mark_price);
        self.quotes.insert(symbol, QuotePair { a: Some(a), b: Some(b) });
    }
}

/// Reads of one symbol from both venues
struct SymbolRead {
    symbol: String,
    quote_a: Option<FundingQuote>,
    quote_b: Option<FundingQuote>,
    mark_a: Option<f64>,
    mark_b: Option<f64>,
}

/// Polls both venues each cycle and derives spreads, volatility and sizing
pub struct DataAggregator {
    venues: VenuePair,
    config: Arc<ArbitrageConfig>,
    ledger: Option<Arc<DryRunLedger>>,
    history: DashMap<String, PriceHistory>,
    previous_rates: DashMap<(String, Exchange), f64>,
}

impl DataAggregator {
    /// Create an aggregator; with a ledger, balances come from paper accounts
    pub fn new(venues: VenuePair, config: Arc<ArbitrageConfig>, ledger: Option<Arc<DryRunLedger>>) -> Self {
        Self {
            venues,
            config,
            ledger,
            history: DashMap::new(),
            previous_rates: DashMap::new(),
        }
    }

    /// Collect one snapshot.
    ///
    /// Fails with [`ArbitrageError::NoMarketData`] when no symbol could be
    /// quoted on both venues.
    pub async fn collect(&self, cycle: u64) -> Result<MarketSnapshot> {
        let (exchange_a, exchange_b) = self.venues.exchanges();
        let (reads, (balances, positions)) = tokio::join!(self.read_symbols(), self.read_accounts());

        let now = Utc::now();
        let periods = self.config.periods_per_year();
        let mut snapshot = MarketSnapshot::new(cycle, exchange_a, exchange_b, now);

        for read in reads {
            let quote_a = read.quote_a.map(|q| self.normalize(q, periods));
            let quote_b = read.quote_b.map(|q| self.normalize(q, periods));

            if let Some(mark) = read.mark_a {
                snapshot.marks.insert((read.symbol.clone(), exchange_a), mark);
            }
            if let Some(mark) = read.mark_b {
                snapshot.marks.insert((read.symbol.clone(), exchange_b), mark);
            }

            let samples: Vec<f64> = [read.mark_a, read.mark_b].into_iter().flatten().collect();
            let reading = {
                let mut history = self
                    .history
                    .entry(read.symbol.clone())
                    .or_insert_with(|| PriceHistory::new(self.config.risk.volatility_window_seconds));
                if samples.is_empty() {
                    history.prune(now);
                } else {
                    history.record(now, samples.iter().sum::<f64>() / samples.len() as f64);
                }
                history.reading(self.config.risk.max_volatility_pct)
            };
            snapshot.volatility.insert(read.symbol.clone(), reading);

            match (&quote_a, &quote_b) {
                (Some(a), Some(b)) => {
                    if let Some(spread) = Spread::from_quotes(a, b, periods) {
                        log_spread!(
                            debug,
                            spread.symbol,
                            spread.short_exchange,
                            spread.long_exchange,
                            format!("{:.2}", spread.annualized_spread),
                            cycle = cycle,
                            "Funding spread"
                        );
                        snapshot.spreads.insert(read.symbol.clone(), spread);
                    }
                }
                _ => debug!("{}: funding quote missing on at least one venue", read.symbol),
            }

            snapshot.quotes.insert(read.symbol, QuotePair { a: quote_a, b: quote_b });
        }

        if let (Some(a), Some(b)) = (balances.get(&exchange_a), balances.get(&exchange_b)) {
            let smaller = a.available_balance.min(b.available_balance);
            snapshot.max_position_size = Some(
                (smaller * self.config.risk.max_position_fraction)
                    .min(self.config.strategy.max_total_position_usd),
            );
        }
        snapshot.balances = balances;
        snapshot.positions = positions;

        if snapshot.spreads.is_empty() {
            warn!("Cycle {}: no funding data for any symbol", cycle);
            return Err(ArbitrageError::NoMarketData.into());
        }

        Ok(snapshot)
    }

    /// Re-annualize with the configured period count and attach the trend
    fn normalize(&self, mut quote: FundingQuote, periods_per_year: f64) -> FundingQuote {
        quote.annualized_rate = annualize(quote.rate, periods_per_year);
        let key = (quote.symbol.clone(), quote.exchange);
        let previous = self.previous_rates.insert(key, quote.rate);
        quote.trend = FundingTrend::between(previous, quote.rate);
        quote
    }

    async fn read_symbols(&self) -> Vec<SymbolRead> {
        let (a, b) = (self.venues.a(), self.venues.b());
        join_all(self.config.strategy.symbols.iter().map(|symbol| async move {
            let (quote_a, quote_b) = tokio::join!(a.get_funding_info(symbol), b.get_funding_info(symbol));
            let (mark_a, mark_b) = tokio::join!(
                mark_or_fallback(a.as_ref(), symbol, quote_a.as_ref()),
                mark_or_fallback(b.as_ref(), symbol, quote_b.as_ref())
            );
            SymbolRead {
                symbol: symbol.clone(),
                quote_a,
                quote_b,
                mark_a,
                mark_b,
            }
        }))
        .await
    }

    async fn read_accounts(&self) -> (HashMap<Exchange, AccountBalance>, HashMap<Exchange, Vec<Position>>) {
        let mut balances = HashMap::new();
        let mut positions = HashMap::new();

        if let Some(ledger) = &self.ledger {
            for adapter in self.venues.iter() {
                let exchange = adapter.exchange();
                if let Some(balance) = ledger.balance(exchange).await {
                    balances.insert(exchange, balance);
                }
            }
            return (balances, positions);
        }

        let (a, b) = (self.venues.a(), self.venues.b());
        let (balance_a, balance_b, positions_a, positions_b) = tokio::join!(
            a.get_balance(),
            b.get_balance(),
            a.get_all_positions(),
            b.get_all_positions()
        );

        for (exchange, balance) in [(a.exchange(), balance_a), (b.exchange(), balance_b)] {
            match balance {
                Some(balance) => {
                    balances.insert(exchange, balance);
                }
                None => warn!("Balance on {} unknown this cycle", exchange),
            }
        }
        for (exchange, list) in [(a.exchange(), positions_a), (b.exchange(), positions_b)] {
            match list {
                Some(list) => {
                    positions.insert(exchange, list);
                }
                None => warn!("Positions on {} unknown this cycle", exchange),
            }
        }

        (balances, positions)
    }
}

async fn mark_or_fallback(
    adapter: &dyn ExchangeAdapter,
    symbol: &str,
    quote: Option<&FundingQuote>,
) -> Option<f64> {
    match quote {
        Some(quote) => Some(quote.mark_price),
        None => adapter.get_mark_price(symbol).await,
    }
}
