//! Integration tests for the funding-rate arbitrage engine

mod test_binance_adapter;
mod test_bybit_adapter;
mod test_engine_cycle;
mod test_position_lifecycle;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use funding_rate_arbitrage::{
    config::ArbitrageConfig,
    connectors::{
        execute_adjustment, AccountBalance, Exchange, ExchangeAdapter, ExecutionResult, FundingQuote, Position,
        PositionSide, VenuePair,
    },
    data::DEFAULT_PERIODS_PER_YEAR,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Test utilities for integration tests
pub struct TestUtils;

impl TestUtils {
    /// Configuration trading BTC and ETH with cooldowns disabled
    pub fn create_test_config(dry_run: bool) -> ArbitrageConfig {
        let mut config = ArbitrageConfig::default();
        config.strategy.symbols = vec!["BTC".to_string(), "ETH".to_string()];
        config.strategy.dry_run = dry_run;
        config.strategy.rotation_jitter_seconds = 0;
        config.execution.min_trade_interval_seconds = 0;
        config
    }

    /// Two scripted venues with BTC funding 0.0002 on Binance and -0.0001 on Bybit
    pub fn wide_btc_spread() -> (Arc<ScriptedExchange>, Arc<ScriptedExchange>) {
        let binance = Arc::new(
            ScriptedExchange::new(Exchange::Binance)
                .with_quote("BTC", 0.0002, 50_000.0)
                .with_balance(10_000.0),
        );
        let bybit = Arc::new(
            ScriptedExchange::new(Exchange::Bybit)
                .with_quote("BTC", -0.0001, 50_000.0)
                .with_balance(10_000.0),
        );
        (binance, bybit)
    }

    /// Venue pair over two scripted venues
    pub fn venues(a: &Arc<ScriptedExchange>, b: &Arc<ScriptedExchange>) -> VenuePair {
        let a: Arc<dyn ExchangeAdapter> = a.clone();
        let b: Arc<dyn ExchangeAdapter> = b.clone();
        VenuePair::new(a, b).expect("distinct venues")
    }
}

/// An order the scripted venue received
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    /// Canonical symbol
    pub symbol: String,
    /// Order direction
    pub side: PositionSide,
    /// Requested notional
    pub size_usd: f64,
    /// Reduce-only flag
    pub reduce_only: bool,
}

/// Mutable script of a venue
#[derive(Debug, Default)]
pub struct ScriptState {
    /// Funding rate per symbol
    pub rates: HashMap<String, f64>,
    /// Mark price per symbol
    pub marks: HashMap<String, f64>,
    /// Reported balance
    pub balance: Option<AccountBalance>,
    /// Net position per symbol
    pub positions: HashMap<String, Position>,
    /// Every order received
    pub orders: Vec<OrderRecord>,
    /// Reject this many upcoming opening orders
    pub reject_opens: u32,
    /// Reject every reduce-only order and close
    pub reject_reduce_only: bool,
    /// Report positions as unknown
    pub positions_unavailable: bool,
    /// Next funding settlement reported with quotes
    pub next_settlement: Option<DateTime<Utc>>,
}

/// In-memory venue that fills orders against a script
pub struct ScriptedExchange {
    exchange: Exchange,
    state: Mutex<ScriptState>,
}

impl ScriptedExchange {
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            state: Mutex::new(ScriptState::default()),
        }
    }

    pub fn with_quote(self, symbol: &str, rate: f64, mark: f64) -> Self {
        self.set_quote(symbol, rate, mark);
        self
    }

    pub fn with_balance(self, available: f64) -> Self {
        self.state().balance = Some(AccountBalance {
            equity: available,
            available_balance: available,
            margin_used: 0.0,
        });
        self
    }

    pub fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().expect("script lock")
    }

    pub fn set_quote(&self, symbol: &str, rate: f64, mark: f64) {
        let mut state = self.state();
        state.rates.insert(symbol.to_string(), rate);
        state.marks.insert(symbol.to_string(), mark);
    }

    pub fn clear_quotes(&self) {
        let mut state = self.state();
        state.rates.clear();
        state.marks.clear();
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.state().orders.clone()
    }

    pub fn order_count(&self) -> usize {
        self.state().orders.len()
    }

    pub fn held(&self, symbol: &str) -> Option<Position> {
        self.state().positions.get(symbol).cloned()
    }

    fn fill(state: &mut ScriptState, exchange: Exchange, symbol: &str, side: PositionSide, size_usd: f64, mark: f64) {
        let quantity = size_usd / mark;
        match state.positions.get_mut(symbol) {
            Some(position) if position.side == side => {
                position.size += quantity;
            }
            Some(position) => {
                position.size -= quantity;
                if position.size <= 1e-12 {
                    state.positions.remove(symbol);
                }
            }
            None => {
                state.positions.insert(
                    symbol.to_string(),
                    Position {
                        symbol: symbol.to_string(),
                        exchange,
                        side,
                        size: quantity,
                        entry_price: mark,
                        mark_price: mark,
                        unrealized_pnl: 0.0,
                    },
                );
            }
        }
    }
}

#[async_trait]
impl ExchangeAdapter for ScriptedExchange {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn initialize(&self) -> bool {
        true
    }

    async fn close(&self) {}

    async fn get_funding_info(&self, symbol: &str) -> Option<FundingQuote> {
        let state = self.state();
        let rate = *state.rates.get(symbol)?;
        let mark = *state.marks.get(symbol)?;
        Some(FundingQuote::new(
            symbol,
            self.exchange,
            rate,
            mark,
            state.next_settlement,
            DEFAULT_PERIODS_PER_YEAR,
        ))
    }

    async fn get_mark_price(&self, symbol: &str) -> Option<f64> {
        self.state().marks.get(symbol).copied()
    }

    async fn get_balance(&self) -> Option<AccountBalance> {
        self.state().balance
    }

    async fn get_position(&self, symbol: &str) -> Option<Position> {
        self.held(symbol)
    }

    async fn get_all_positions(&self) -> Option<Vec<Position>> {
        let state = self.state();
        if state.positions_unavailable {
            return None;
        }
        Some(state.positions.values().cloned().collect())
    }

    async fn open_position(&self, symbol: &str, side: PositionSide, size_usd: f64, reduce_only: bool) -> ExecutionResult {
        let mut state = self.state();
        state.orders.push(OrderRecord {
            symbol: symbol.to_string(),
            side,
            size_usd,
            reduce_only,
        });
        if reduce_only && state.reject_reduce_only {
            return ExecutionResult::rejected("reduce-only rejected by script");
        }
        if !reduce_only && state.reject_opens > 0 {
            state.reject_opens -= 1;
            return ExecutionResult::rejected("order rejected by script");
        }
        let Some(mark) = state.marks.get(symbol).copied() else {
            return ExecutionResult::rejected("no mark price");
        };
        Self::fill(&mut state, self.exchange, symbol, side, size_usd, mark);
        let id = format!("{}-{}", self.exchange, state.orders.len());
        ExecutionResult::filled(id, size_usd)
    }

    async fn close_position(&self, symbol: &str) -> ExecutionResult {
        let mut state = self.state();
        let Some(position) = state.positions.get(symbol).cloned() else {
            return ExecutionResult::noop();
        };
        state.orders.push(OrderRecord {
            symbol: symbol.to_string(),
            side: position.side.opposite(),
            size_usd: position.notional_value(),
            reduce_only: true,
        });
        if state.reject_reduce_only {
            return ExecutionResult::rejected("close rejected by script");
        }
        state.positions.remove(symbol);
        let id = format!("{}-{}", self.exchange, state.orders.len());
        ExecutionResult::filled(id, position.notional_value())
    }

    async fn adjust_position(&self, symbol: &str, target_size_usd: f64, target_side: PositionSide) -> ExecutionResult {
        execute_adjustment(self, symbol, target_size_usd, target_side, 1.0).await
    }

    fn to_exchange_symbol(&self, symbol: &str) -> String {
        format!("{}USDT", symbol)
    }

    fn from_exchange_symbol(&self, exchange_symbol: &str) -> String {
        exchange_symbol.trim_end_matches("USDT").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_config() {
        let config = TestUtils::create_test_config(true);
        assert_eq!(config.strategy.symbols, vec!["BTC", "ETH"]);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_scripted_exchange_nets_positions() {
        let venue = ScriptedExchange::new(Exchange::Binance).with_quote("BTC", 0.0001, 100.0);
        assert!(venue.open_position("BTC", PositionSide::Short, 500.0, false).await.success);
        assert_eq!(venue.held("BTC").unwrap().size, 5.0);

        assert!(venue.open_position("BTC", PositionSide::Long, 500.0, true).await.success);
        assert!(venue.held("BTC").is_none());
        assert_eq!(venue.order_count(), 2);

        let adjusted = venue.adjust_position("BTC", 200.0, PositionSide::Long).await;
        assert!(adjusted.success);
        assert_eq!(venue.held("BTC").unwrap().side, PositionSide::Long);
    }
}
