//! Paper trading ledger used in dry-run mode

use crate::connectors::{AccountBalance, Exchange, ExecutionResult, PositionSide};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Paper account on one venue
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperAccount {
    /// Paper equity
    pub equity: f64,
    /// Notional committed to open simulated legs
    pub margin_used: f64,
}

impl PaperAccount {
    fn balance(&self) -> AccountBalance {
        AccountBalance {
            equity: self.equity,
            available_balance: (self.equity - self.margin_used).max(0.0),
            margin_used: self.margin_used,
        }
    }
}

/// Counters of simulated activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperMetrics {
    /// Simulated orders
    pub total_orders: u64,
    /// Simulated notional
    pub total_volume: f64,
}

/// Simulated venue accounts; fills every order in full at the requested notional
pub struct DryRunLedger {
    accounts: RwLock<HashMap<Exchange, PaperAccount>>,
    metrics: RwLock<PaperMetrics>,
}

impl DryRunLedger {
    /// Ledger with `paper_balance_usd` on each venue
    pub fn new(exchanges: &[Exchange], paper_balance_usd: f64) -> Self {
        let accounts = exchanges
            .iter()
            .map(|exchange| {
                (
                    *exchange,
                    PaperAccount {
                        equity: paper_balance_usd,
                        margin_used: 0.0,
                    },
                )
            })
            .collect();

        Self {
            accounts: RwLock::new(accounts),
            metrics: RwLock::new(PaperMetrics::default()),
        }
    }

    /// Paper balance of a venue
    pub async fn balance(&self, exchange: Exchange) -> Option<AccountBalance> {
        self.accounts.read().await.get(&exchange).map(PaperAccount::balance)
    }

    /// Simulate a market order. No network calls are made.
    pub async fn fill(
        &self,
        exchange: Exchange,
        symbol: &str,
        side: PositionSide,
        size_usd: f64,
        reduce_only: bool,
    ) -> ExecutionResult {
        {
            let mut accounts = self.accounts.write().await;
            let Some(account) = accounts.get_mut(&exchange) else {
                return ExecutionResult::rejected(format!("no paper account on {}", exchange));
            };
            if reduce_only {
                account.margin_used = (account.margin_used - size_usd).max(0.0);
            } else {
                account.margin_used += size_usd;
            }
        }

        {
            let mut metrics = self.metrics.write().await;
            metrics.total_orders += 1;
            metrics.total_volume += size_usd;
        }

        let order_id = format!("dry-{}", Uuid::new_v4());
        debug!(
            "[DRY RUN] {} {} {} ${:.2} (reduce_only={}) -> {}",
            exchange, side, symbol, size_usd, reduce_only, order_id
        );
        ExecutionResult::filled(order_id, size_usd)
    }

    /// Simulated activity so far
    pub async fn metrics(&self) -> PaperMetrics {
        self.metrics.read().await.clone()
    }
}
