//! The scan, decide, execute, rotate loop

use super::{AdvisoryProvider, Decision, DecisionAction, DecisionPolicy};
use crate::{
    config::ArbitrageConfig,
    connectors::{ConnectorFactory, ExecutionResult, VenuePair},
    data::{DataAggregator, MarketSnapshot},
    trading::{DryRunLedger, Executor, PositionManager},
    utils::metrics,
    ArbitrageError, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Stops a running engine between cycles
#[derive(Clone)]
pub struct EngineHandle {
    stop_tx: Arc<watch::Sender<bool>>,
}

impl EngineHandle {
    /// Request a graceful stop; an in-flight cycle runs to completion
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }
}

/// Totals reported when the engine stops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Cycles attempted
    pub cycles: u64,
    /// Cycles or actions that ended in an error
    pub errors: u64,
    /// Notional filled across all executions
    pub total_volume_usd: f64,
    /// Successful opens and closes
    pub trades: u64,
    /// Successful rotations
    pub rotations: u64,
    /// Wall-clock run time
    pub duration: Duration,
}

/// What one cycle did
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Cycle number
    pub cycle: u64,
    /// Decision taken
    pub decision: Decision,
    /// Result of executing the decision, if it traded
    pub executed: Option<ExecutionResult>,
    /// Volume rotations performed after the decision
    pub rotations: Vec<(String, ExecutionResult)>,
    /// Orphaned legs closed during sync
    pub orphans_repaired: usize,
}

/// Owns the components and drives them on a timer
pub struct ArbitrageEngine {
    config: Arc<ArbitrageConfig>,
    venues: VenuePair,
    aggregator: DataAggregator,
    manager: Arc<PositionManager>,
    policy: DecisionPolicy,
    advisor: Option<Arc<dyn AdvisoryProvider>>,
    ledger: Option<Arc<DryRunLedger>>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    cycles: u64,
    errors: u64,
    last_snapshot: Option<MarketSnapshot>,
}

impl ArbitrageEngine {
    /// Wire the components around a venue pair.
    ///
    /// With `strategy.dry_run` every order is filled by a paper ledger.
    pub fn new(config: Arc<ArbitrageConfig>, venues: VenuePair) -> Self {
        let (exchange_a, exchange_b) = venues.exchanges();
        let ledger = config
            .strategy
            .dry_run
            .then(|| Arc::new(DryRunLedger::new(&[exchange_a, exchange_b], config.strategy.paper_balance_usd)));

        let executor = Arc::new(Executor::new(venues.clone(), config.clone(), ledger.clone()));
        let manager = Arc::new(PositionManager::new(executor, venues.clone(), config.clone()));
        let aggregator = DataAggregator::new(venues.clone(), config.clone(), ledger.clone());
        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            policy: DecisionPolicy::new(config.clone()),
            config,
            venues,
            aggregator,
            manager,
            advisor: None,
            ledger,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            cycles: 0,
            errors: 0,
            last_snapshot: None,
        }
    }

    /// Build the configured venue pair and wire an engine around it
    pub fn from_config(config: ArbitrageConfig) -> Result<Self> {
        let venues = ConnectorFactory::create_pair(&config)?;
        Ok(Self::new(Arc::new(config), venues))
    }

    /// Consult an advisory provider every cycle
    pub fn with_advisor(mut self, advisor: Arc<dyn AdvisoryProvider>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// Handle for stopping the loop from another task
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Position manager
    pub fn manager(&self) -> &Arc<PositionManager> {
        &self.manager
    }

    /// Allow opens again after the failure breaker tripped
    pub fn reset_failures(&self) {
        self.manager.reset_failures();
    }

    /// Paper ledger in dry run
    pub fn ledger(&self) -> Option<&Arc<DryRunLedger>> {
        self.ledger.as_ref()
    }

    /// Initialize both adapters; fails if either does not come up
    pub async fn initialize(&self) -> Result<()> {
        let (a, b) = (self.venues.a(), self.venues.b());
        let (ready_a, ready_b) = tokio::join!(a.initialize(), b.initialize());
        for (exchange, ready) in [(a.exchange(), ready_a), (b.exchange(), ready_b)] {
            if !ready {
                return Err(ArbitrageError::Connection(format!("{} failed to initialize", exchange)).into());
            }
        }
        info!(
            "Venues ready: A={} B={} ({})",
            a.exchange(),
            b.exchange(),
            if self.ledger.is_some() { "dry run" } else { "live" }
        );
        Ok(())
    }

    /// Collect a single snapshot without trading
    pub async fn snapshot(&self) -> Result<MarketSnapshot> {
        self.aggregator.collect(self.cycles + 1).await
    }

    /// Run until stopped, then shut down and summarize
    pub async fn run(&mut self) -> Result<SessionSummary> {
        self.initialize().await?;
        let started = Instant::now();
        let mut stop = self.stop_rx.clone();
        info!("Engine started; scanning every {:?}", self.config.scan_interval());

        loop {
            if *stop.borrow() {
                break;
            }

            if let Err(e) = self.run_cycle().await {
                self.errors += 1;
                match e.downcast_ref::<ArbitrageError>() {
                    Some(ArbitrageError::NoMarketData) => warn!("Cycle {} skipped: {}", self.cycles, e),
                    _ => error!("Cycle {} failed: {}", self.cycles, e),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval()) => {}
                _ = stop.changed() => {}
            }
        }

        Ok(self.shutdown(started.elapsed()).await)
    }

    /// One full cycle
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycles += 1;
        let cycle = self.cycles;
        let started = Instant::now();

        let snapshot = match self.aggregator.collect(cycle).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                metrics::record_cycle(started.elapsed(), false);
                return Err(e);
            }
        };
        let now = snapshot.taken_at;

        let sync = self.manager.sync(&snapshot).await;
        let orphans_repaired = if sync.orphans.is_empty() {
            0
        } else {
            self.manager.repair_orphans(&sync).await
        };

        let positions = self.manager.positions().await;
        let excluded: HashSet<String> = self
            .manager
            .executor()
            .quarantined()
            .into_iter()
            .map(|(symbol, _)| symbol)
            .collect();
        let proposal = match &self.advisor {
            Some(advisor) => advisor.propose(&snapshot, &positions).await,
            None => None,
        };
        let decision = self.policy.decide(&snapshot, &positions, &excluded, proposal.as_ref(), now);
        debug!("Cycle {} decision: {}", cycle, decision);

        let mut touched = HashSet::new();
        let executed = self.execute(&snapshot, &decision, &mut touched).await;
        let rotations = self.rotate_for_volume(&snapshot, &mut touched).await;
        self.rebalance(&snapshot, &touched).await;

        for spread in snapshot.spreads.values() {
            metrics::set_spread(&spread.symbol, spread.annualized_spread);
        }
        self.log_status(cycle, &decision, executed.as_ref()).await;
        metrics::record_cycle(started.elapsed(), true);

        self.last_snapshot = Some(snapshot);
        Ok(CycleReport {
            cycle,
            decision,
            executed,
            rotations,
            orphans_repaired,
        })
    }

    async fn execute(
        &mut self,
        snapshot: &MarketSnapshot,
        decision: &Decision,
        touched: &mut HashSet<String>,
    ) -> Option<ExecutionResult> {
        let asset = decision.asset.as_deref()?;
        let outcome = match decision.action {
            DecisionAction::Hold => return None,
            DecisionAction::Open => {
                self.manager
                    .open(snapshot, asset, self.config.strategy.position_size_usd)
                    .await
            }
            DecisionAction::Close => self.manager.close(snapshot, asset).await,
            DecisionAction::Rotate => match decision.open_symbol() {
                Some(target) if target != asset => self.manager.rotate_to(snapshot, asset, target).await,
                _ => self.manager.rotate(snapshot, asset).await,
            },
        };

        touched.insert(asset.to_string());
        if let Some(target) = &decision.target_asset {
            touched.insert(target.clone());
        }

        match outcome {
            Ok(result) => {
                if !result.success {
                    warn!("{} failed: {}", decision, result.error.as_deref().unwrap_or("unknown error"));
                }
                Some(result)
            }
            Err(e) => {
                self.errors += 1;
                warn!("{} not executed: {}", decision, e);
                None
            }
        }
    }

    /// Rotate every held pair whose schedule is due and that was not traded this cycle
    async fn rotate_for_volume(
        &mut self,
        snapshot: &MarketSnapshot,
        touched: &mut HashSet<String>,
    ) -> Vec<(String, ExecutionResult)> {
        let mut rotations = Vec::new();
        for position in self.manager.positions().await {
            if touched.contains(&position.symbol)
                || !self.policy.rotation_due(snapshot, &position, snapshot.taken_at)
            {
                continue;
            }
            touched.insert(position.symbol.clone());
            match self.manager.rotate(snapshot, &position.symbol).await {
                Ok(result) => rotations.push((position.symbol.clone(), result)),
                Err(e) => {
                    self.errors += 1;
                    warn!(symbol = %position.symbol, "Volume rotation failed: {}", e);
                }
            }
        }
        rotations
    }

    async fn rebalance(&mut self, snapshot: &MarketSnapshot, touched: &HashSet<String>) {
        for position in self.manager.positions().await {
            if touched.contains(&position.symbol) {
                continue;
            }
            if let Err(e) = self.manager.rebalance_if_needed(snapshot, &position.symbol).await {
                self.errors += 1;
                warn!(symbol = %position.symbol, "Rebalance failed: {}", e);
            }
        }
    }

    async fn log_status(&self, cycle: u64, decision: &Decision, executed: Option<&ExecutionResult>) {
        let stats = self.manager.stats().await;
        info!(
            cycle = cycle,
            action = %decision.action,
            success = executed.map(|r| r.success),
            positions = stats.active_symbols,
            volume_usd = stats.total_volume_usd,
            "Cycle complete"
        );

        let every = self.config.monitoring.status_log_interval_cycles;
        if every == 0 || cycle % every != 0 {
            return;
        }
        info!(
            "Status: {} pairs, {} trades, {} rotations, {} failures, ${:.2} volume, {} consecutive failures",
            stats.active_symbols,
            stats.trades,
            stats.rotations,
            stats.failures,
            stats.total_volume_usd,
            self.manager.executor().consecutive_failures()
        );
        for position in self.manager.positions().await {
            info!(
                "  {} long {} / short {}  ${:.2} per leg, delta ${:.2}, pnl ${:.2}",
                position.symbol,
                position.long_exchange(),
                position.short_exchange(),
                position.target_notional_usd,
                position.delta_imbalance(),
                position.unrealized_pnl()
            );
        }
        for (symbol, reason) in self.manager.executor().quarantined() {
            warn!("  {} quarantined: {}", symbol, reason);
        }
    }

    /// Optionally close all pairs, release the adapters and summarize
    pub async fn shutdown(&mut self, duration: Duration) -> SessionSummary {
        info!("Engine stopping after {} cycles", self.cycles);

        let held = self.manager.positions().await.len();
        if held > 0 && self.config.strategy.leave_positions_open_on_shutdown {
            info!("Leaving {} pairs open", held);
        } else if held > 0 {
            let snapshot = match self.aggregator.collect(self.cycles + 1).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("Fresh snapshot unavailable at shutdown ({}); using the last one", e);
                    self.last_snapshot.take()
                }
            };
            match snapshot {
                Some(snapshot) => {
                    let closed = self.manager.close_all(&snapshot).await;
                    let failed = closed.iter().filter(|(_, r)| !r.success).count();
                    info!("Closed {} of {} pairs at shutdown", closed.len() - failed, held);
                }
                None => warn!("No market data; {} pairs left open", held),
            }
        }

        for adapter in self.venues.iter() {
            adapter.close().await;
        }

        let stats = self.manager.stats().await;
        let summary = SessionSummary {
            cycles: self.cycles,
            errors: self.errors,
            total_volume_usd: stats.total_volume_usd,
            trades: stats.trades,
            rotations: stats.rotations,
            duration,
        };
        info!(
            "Session summary: {} cycles, {} errors, ${:.2} volume, {} trades, {} rotations in {:?}",
            summary.cycles, summary.errors, summary.total_volume_usd, summary.trades, summary.rotations, summary.duration
        );
        summary
    }
}
