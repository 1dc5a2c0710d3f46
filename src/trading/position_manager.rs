//! Ownership of paired positions
//!
//! The manager is the single source of truth for which symbols hold an
//! [`ArbPosition`]. It reconciles its records against venue positions every
//! cycle and routes every trade through the [`Executor`].

use super::{ArbPosition, Executor, SymbolState};
use crate::{
    config::ArbitrageConfig,
    connectors::{Exchange, ExecutionResult, FailureKind, Position, PositionSide, VenuePair},
    data::MarketSnapshot,
    log_position,
    utils::metrics,
    ArbitrageError, Result,
};
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Running totals for the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    /// When the manager was created
    pub started_at: DateTime<Utc>,
    /// Notional filled by all executions
    pub total_volume_usd: f64,
    /// Successful opens and closes
    pub trades: u64,
    /// Successful rotations
    pub rotations: u64,
    /// Executions that sent orders and did not complete
    pub failures: u64,
    /// Pairs currently held
    pub active_symbols: usize,
}

/// What a reconciliation pass found
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Single legs without a counterpart
    pub orphans: Vec<Position>,
    /// Symbols quarantined because both legs had the same side
    pub quarantined: Vec<String>,
    /// Symbols found in a transient state and reset
    pub reset: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Trade,
    Rotation,
    Repair,
}

struct Book {
    positions: IndexMap<String, ArbPosition>,
    states: HashMap<String, SymbolState>,
    last_trade: HashMap<String, DateTime<Utc>>,
    stats: SessionStats,
}

/// Tracks paired positions and drives their lifecycle
pub struct PositionManager {
    executor: Arc<Executor>,
    venues: VenuePair,
    config: Arc<ArbitrageConfig>,
    book: RwLock<Book>,
}

impl PositionManager {
    /// Create a manager with no positions
    pub fn new(executor: Arc<Executor>, venues: VenuePair, config: Arc<ArbitrageConfig>) -> Self {
        Self {
            executor,
            venues,
            config,
            book: RwLock::new(Book {
                positions: IndexMap::new(),
                states: HashMap::new(),
                last_trade: HashMap::new(),
                stats: SessionStats {
                    started_at: Utc::now(),
                    total_volume_usd: 0.0,
                    trades: 0,
                    rotations: 0,
                    failures: 0,
                    active_symbols: 0,
                },
            }),
        }
    }

    /// Executor all trades go through
    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Held pairs in the order they were recorded
    pub async fn positions(&self) -> Vec<ArbPosition> {
        self.book.read().await.positions.values().cloned().collect()
    }

    /// Held pair for a symbol
    pub async fn get(&self, symbol: &str) -> Option<ArbPosition> {
        self.book.read().await.positions.get(symbol).cloned()
    }

    /// Lifecycle state of a symbol
    pub async fn state(&self, symbol: &str) -> SymbolState {
        if self.executor.is_quarantined(symbol) {
            return SymbolState::Quarantined;
        }
        let book = self.book.read().await;
        match book.states.get(symbol) {
            Some(state) => *state,
            None if book.positions.contains_key(symbol) => SymbolState::Open,
            None => SymbolState::Closed,
        }
    }

    /// Summed per-leg notional of all held pairs
    pub async fn total_notional(&self) -> f64 {
        self.book
            .read()
            .await
            .positions
            .values()
            .map(|p| p.target_notional_usd)
            .sum()
    }

    /// Whether a symbol traded within `min_trade_interval_seconds` of `now`
    pub async fn in_cooldown(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        let interval = Duration::seconds(self.config.execution.min_trade_interval_seconds as i64);
        self.book
            .read()
            .await
            .last_trade
            .get(symbol)
            .map_or(false, |last| now - *last < interval)
    }

    /// Session totals
    pub async fn stats(&self) -> SessionStats {
        let book = self.book.read().await;
        SessionStats {
            active_symbols: book.positions.len(),
            ..book.stats.clone()
        }
    }

    /// Re-admit a quarantined symbol; the next sync adopts whatever it holds
    pub async fn clear_quarantine(&self, symbol: &str) -> bool {
        let cleared = self.executor.clear_quarantine(symbol);
        if cleared {
            self.book.write().await.states.insert(symbol.to_string(), SymbolState::Closed);
        }
        cleared
    }

    /// Re-arm opening after the failure breaker tripped
    pub fn reset_failures(&self) {
        self.executor.reset_failures();
    }

    /// Reconcile records with what the venues report.
    ///
    /// In live mode a venue whose positions are unknown leaves every record
    /// untouched. In dry run only mark prices are refreshed.
    pub async fn sync(&self, snapshot: &MarketSnapshot) -> SyncReport {
        let mut report = SyncReport::default();
        let mut book = self.book.write().await;

        let stuck: Vec<String> = book
            .states
            .iter()
            .filter(|(_, state)| state.is_transient())
            .map(|(symbol, _)| symbol.clone())
            .collect();
        for symbol in stuck {
            let state = book.states[&symbol];
            warn!(symbol = %symbol, "Inconsistent state {} at sync; forcing reconciliation", state);
            let reset = if book.positions.contains_key(&symbol) {
                SymbolState::Open
            } else {
                SymbolState::Closed
            };
            book.states.insert(symbol.clone(), reset);
            report.reset.push(symbol);
        }

        if self.executor.is_dry_run() {
            for position in book.positions.values_mut() {
                let long_mark = snapshot.mark_price(&position.symbol, position.long_exchange());
                let short_mark = snapshot.mark_price(&position.symbol, position.short_exchange());
                position.refresh_marks(long_mark, short_mark);
            }
            self.publish(&book);
            return report;
        }

        let (exchange_a, exchange_b) = self.venues.exchanges();
        let (Some(legs_a), Some(legs_b)) = (snapshot.positions_on(exchange_a), snapshot.positions_on(exchange_b))
        else {
            debug!("Venue positions unknown; records left untouched");
            return report;
        };

        let symbols: BTreeSet<String> = self
            .config
            .strategy
            .symbols
            .iter()
            .cloned()
            .chain(book.positions.keys().cloned())
            .collect();

        for symbol in symbols {
            if self.executor.is_quarantined(&symbol) {
                book.states.insert(symbol, SymbolState::Quarantined);
                continue;
            }
            let leg_a = legs_a.iter().find(|p| p.symbol == symbol && p.size > 0.0);
            let leg_b = legs_b.iter().find(|p| p.symbol == symbol && p.size > 0.0);

            match (leg_a, leg_b) {
                (Some(a), Some(b)) if a.side != b.side => {
                    let (long, short) = if a.side == PositionSide::Long { (a, b) } else { (b, a) };
                    self.adopt(&mut book, long.clone(), short.clone(), snapshot.taken_at);
                }
                (Some(a), Some(_)) => {
                    self.executor
                        .quarantine(&symbol, format!("both legs of {} are {} positions", symbol, a.side));
                    book.positions.shift_remove(&symbol);
                    book.states.insert(symbol.clone(), SymbolState::Quarantined);
                    report.quarantined.push(symbol);
                }
                (Some(leg), None) | (None, Some(leg)) => {
                    warn!(
                        symbol = %symbol,
                        exchange = %leg.exchange,
                        "Orphaned {} leg of ${:.2}",
                        leg.side,
                        leg.notional_value()
                    );
                    book.positions.shift_remove(&symbol);
                    book.states.insert(symbol, SymbolState::Closed);
                    report.orphans.push(leg.clone());
                }
                (None, None) => {
                    if book.positions.shift_remove(&symbol).is_some() {
                        warn!(symbol = %symbol, "Pair no longer held on either venue; record removed");
                    }
                    book.states.insert(symbol, SymbolState::Closed);
                }
            }
        }

        self.publish(&book);
        report
    }

    /// Close every orphaned leg from a sync; returns how many closed
    pub async fn repair_orphans(&self, report: &SyncReport) -> usize {
        let mut repaired = 0;
        for orphan in &report.orphans {
            let result = self.executor.close_orphan(orphan.exchange, &orphan.symbol).await;
            self.account(&orphan.symbol, &result, Activity::Repair, Utc::now()).await;
            if result.success {
                repaired += 1;
            }
        }
        repaired
    }

    /// Open a pair on `symbol` at `size_usd` per leg
    pub async fn open(&self, snapshot: &MarketSnapshot, symbol: &str, size_usd: f64) -> Result<ExecutionResult> {
        {
            let book = self.book.read().await;
            if book.positions.contains_key(symbol) {
                return Err(ArbitrageError::Trading(format!("{} already holds a pair", symbol)).into());
            }
        }
        if self.in_cooldown(symbol, snapshot.taken_at).await {
            return Ok(self.cooldown(symbol));
        }

        self.set_state(symbol, SymbolState::Opening).await;
        let result = self.executor.open(snapshot, symbol, size_usd).await;

        let record = if result.success {
            self.record_for(snapshot, symbol, result.filled_notional / 2.0, None).await
        } else {
            None
        };
        if result.success && record.is_none() {
            self.quarantine_unrecorded(symbol);
        }
        let mut book = self.book.write().await;
        match record {
            Some(position) => {
                log_position!(
                    info,
                    symbol,
                    position.long_exchange(),
                    position.short_exchange(),
                    format!("{:.2}", position.target_notional_usd),
                    "Pair opened"
                );
                book.positions.insert(symbol.to_string(), position);
                book.states.insert(symbol.to_string(), SymbolState::Open);
            }
            None => {
                book.states.insert(symbol.to_string(), SymbolState::Closed);
            }
        }
        drop(book);

        self.account(symbol, &result, Activity::Trade, snapshot.taken_at).await;
        Ok(result)
    }

    /// Close the pair held on `symbol`
    pub async fn close(&self, snapshot: &MarketSnapshot, symbol: &str) -> Result<ExecutionResult> {
        let position = self
            .get(symbol)
            .await
            .ok_or_else(|| ArbitrageError::Trading(format!("{} holds no pair", symbol)))?;

        self.set_state(symbol, SymbolState::Closing).await;
        let result = self.executor.close(snapshot, &position).await;

        {
            let mut book = self.book.write().await;
            if result.success {
                book.positions.shift_remove(symbol);
                book.states.insert(symbol.to_string(), SymbolState::Closed);
                log_position!(
                    info,
                    symbol,
                    position.long_exchange(),
                    position.short_exchange(),
                    format!("{:.2}", position.target_notional_usd),
                    pnl = position.unrealized_pnl(),
                    "Pair closed"
                );
            } else {
                book.states.insert(symbol.to_string(), SymbolState::Open);
            }
        }

        self.account(symbol, &result, Activity::Trade, snapshot.taken_at).await;
        Ok(result)
    }

    /// Close and reopen the pair on `symbol` at its current size
    pub async fn rotate(&self, snapshot: &MarketSnapshot, symbol: &str) -> Result<ExecutionResult> {
        self.rotate_to(snapshot, symbol, symbol).await
    }

    /// Close the pair on `from` and open one on `to` at the same size.
    ///
    /// The new pair's direction follows the latest spread of `to`.
    pub async fn rotate_to(&self, snapshot: &MarketSnapshot, from: &str, to: &str) -> Result<ExecutionResult> {
        let position = self
            .get(from)
            .await
            .ok_or_else(|| ArbitrageError::Trading(format!("{} holds no pair", from)))?;
        if from != to && self.get(to).await.is_some() {
            return Err(ArbitrageError::Trading(format!("{} already holds a pair", to)).into());
        }
        for symbol in [from, to] {
            if self.in_cooldown(symbol, snapshot.taken_at).await {
                return Ok(self.cooldown(symbol));
            }
        }

        self.set_state(from, SymbolState::Rotating).await;
        let rotation = self
            .executor
            .rotate(snapshot, &position, to, position.target_notional_usd)
            .await;

        let record = match &rotation.open {
            Some(open) if open.success => {
                let opened_at = (from == to).then_some(position.opened_at);
                self.record_for(snapshot, to, open.filled_notional / 2.0, opened_at).await
            }
            _ => None,
        };
        if rotation.open.as_ref().map_or(false, |open| open.success) && record.is_none() {
            self.quarantine_unrecorded(to);
        }

        {
            let mut book = self.book.write().await;
            if rotation.close.success {
                book.positions.shift_remove(from);
                book.states.insert(from.to_string(), SymbolState::Closed);
            } else {
                book.states.insert(from.to_string(), SymbolState::Open);
            }
            if let Some(mut next) = record {
                next.last_rotated_at = Some(snapshot.taken_at);
                log_position!(
                    info,
                    to,
                    next.long_exchange(),
                    next.short_exchange(),
                    format!("{:.2}", next.target_notional_usd),
                    from = %from,
                    "Pair rotated"
                );
                book.positions.insert(to.to_string(), next);
                book.states.insert(to.to_string(), SymbolState::Open);
            }
        }

        let result = rotation.summary();
        self.account(from, &result, Activity::Rotation, snapshot.taken_at).await;
        if from != to && rotation.open.is_some() {
            self.book.write().await.last_trade.insert(to.to_string(), snapshot.taken_at);
        }
        Ok(result)
    }

    /// Rotate a pair whose legs drifted apart; `None` when balanced
    pub async fn rebalance_if_needed(
        &self,
        snapshot: &MarketSnapshot,
        symbol: &str,
    ) -> Result<Option<ExecutionResult>> {
        let Some(position) = self.get(symbol).await else {
            return Ok(None);
        };
        let delta = position.delta_imbalance();
        let risk = &self.config.risk;
        if delta.abs() <= risk.max_delta_imbalance_usd && position.is_balanced(risk.balance_tolerance) {
            return Ok(None);
        }

        log_position!(
            warn,
            symbol,
            position.long_exchange(),
            position.short_exchange(),
            format!("{:.2}", position.target_notional_usd),
            delta = delta,
            ratio = position.imbalance_ratio(),
            "Pair out of balance; rotating"
        );
        self.rotate(snapshot, symbol).await.map(Some)
    }

    /// Close every held pair; failures are logged and kept
    pub async fn close_all(&self, snapshot: &MarketSnapshot) -> Vec<(String, ExecutionResult)> {
        let symbols: Vec<String> = self.book.read().await.positions.keys().cloned().collect();
        let mut results = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.close(snapshot, &symbol).await {
                Ok(result) => {
                    if !result.success {
                        warn!(symbol = %symbol, "Pair left open at shutdown: {:?}", result.error);
                    }
                    results.push((symbol, result));
                }
                Err(e) => warn!(symbol = %symbol, "Close skipped: {}", e),
            }
        }
        results
    }

    fn adopt(&self, book: &mut Book, long: Position, short: Position, now: DateTime<Utc>) {
        let symbol = long.symbol.clone();
        match book.positions.get_mut(&symbol) {
            Some(existing) => {
                existing.long = long;
                existing.short = short;
            }
            None => {
                let target = (long.notional_value() + short.notional_value()) / 2.0;
                match ArbPosition::new(long, short, target, now, self.next_rotation(now)) {
                    Ok(position) => {
                        log_position!(
                            info,
                            symbol,
                            position.long_exchange(),
                            position.short_exchange(),
                            format!("{:.2}", target),
                            "Adopted pair found on venues"
                        );
                        book.positions.insert(symbol.clone(), position);
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, "Cannot adopt venue legs: {}", e);
                        return;
                    }
                }
            }
        }
        book.states.insert(symbol, SymbolState::Open);
    }

    /// Build the record for a freshly opened pair
    async fn record_for(
        &self,
        snapshot: &MarketSnapshot,
        symbol: &str,
        notional_per_leg: f64,
        opened_at: Option<DateTime<Utc>>,
    ) -> Option<ArbPosition> {
        let spread = snapshot.spread(symbol)?;
        let (long_exchange, short_exchange) = (spread.long_exchange, spread.short_exchange);
        let now = snapshot.taken_at;
        let opened_at = opened_at.unwrap_or(now);
        let next_rotation = self.next_rotation(now);

        if !self.executor.is_dry_run() {
            if let Some((long, short)) = self.read_back(symbol, long_exchange, short_exchange).await {
                return ArbPosition::new(long, short, notional_per_leg, opened_at, next_rotation).ok();
            }
            debug!(symbol = %symbol, "Venue legs not readable yet; recording fills");
        }

        let mark = |exchange: Exchange| {
            snapshot
                .mark_price(symbol, exchange)
                .or_else(|| snapshot.any_mark_price(symbol))
                .unwrap_or(0.0)
        };
        match ArbPosition::from_fills(
            symbol,
            long_exchange,
            mark(long_exchange),
            short_exchange,
            mark(short_exchange),
            notional_per_leg,
            opened_at,
            next_rotation,
        ) {
            Ok(position) => Some(position),
            Err(e) => {
                warn!(symbol = %symbol, "Opened pair could not be recorded: {}", e);
                None
            }
        }
    }

    /// Both legs filled but no record could be built; keep the symbol out of
    /// automated trading until an operator clears it and sync adopts the legs
    fn quarantine_unrecorded(&self, symbol: &str) {
        let failure = ArbitrageError::Trading(format!("{} filled on both venues but could not be recorded", symbol));
        self.executor.quarantine(symbol, failure.to_string());
    }

    async fn read_back(
        &self,
        symbol: &str,
        long_exchange: Exchange,
        short_exchange: Exchange,
    ) -> Option<(Position, Position)> {
        let long_venue = self.venues.get(long_exchange)?;
        let short_venue = self.venues.get(short_exchange)?;
        let (long, short) = tokio::join!(long_venue.get_position(symbol), short_venue.get_position(symbol));
        match (long, short) {
            (Some(long), Some(short)) if long.side == PositionSide::Long && short.side == PositionSide::Short => {
                Some((long, short))
            }
            _ => None,
        }
    }

    fn next_rotation(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let strategy = &self.config.strategy;
        let jitter = if strategy.rotation_jitter_seconds > 0 {
            rand::thread_rng().gen_range(0..=strategy.rotation_jitter_seconds)
        } else {
            0
        };
        from + Duration::seconds((strategy.rotation_interval_seconds + jitter) as i64)
    }

    fn cooldown(&self, symbol: &str) -> ExecutionResult {
        debug!(symbol = %symbol, "Symbol in cooldown");
        ExecutionResult::failed(FailureKind::Cooldown, format!("{} traded too recently", symbol))
    }

    async fn set_state(&self, symbol: &str, state: SymbolState) {
        self.book.write().await.states.insert(symbol.to_string(), state);
    }

    /// Fold an execution into the session totals and cooldowns
    async fn account(&self, symbol: &str, result: &ExecutionResult, activity: Activity, at: DateTime<Utc>) {
        let sent_orders = !matches!(
            result.failure,
            Some(FailureKind::CircuitBreaker(_))
                | Some(FailureKind::Cooldown)
                | Some(FailureKind::Quarantined)
                | Some(FailureKind::MissingData)
        );
        if !sent_orders {
            return;
        }

        let mut book = self.book.write().await;
        book.stats.total_volume_usd += result.filled_notional;
        match (result.success, activity) {
            (false, _) => book.stats.failures += 1,
            (true, Activity::Trade) => book.stats.trades += 1,
            (true, Activity::Rotation) => book.stats.rotations += 1,
            (true, Activity::Repair) => {}
        }
        if activity != Activity::Repair {
            book.last_trade.insert(symbol.to_string(), at);
        }
        self.publish(&book);
    }

    fn publish(&self, book: &Book) {
        let notional = book.positions.values().map(|p| p.target_notional_usd).sum();
        metrics::set_positions(book.positions.len(), notional);
    }
}
