//! Per-cycle decision making
//!
//! The policy derives one [`Decision`] from a snapshot with fixed rules and
//! accepts an external proposal only when it agrees with the data.

use crate::{
    config::ArbitrageConfig,
    connectors::PositionSide,
    data::{MarketSnapshot, Spread},
    trading::ArbPosition,
    ArbitrageError,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What to do this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    /// Open a new pair
    Open,
    /// Close a held pair
    Close,
    /// Close a held pair and reopen, possibly on another symbol
    Rotate,
    /// Do nothing
    Hold,
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecisionAction::Open => "OPEN",
            DecisionAction::Close => "CLOSE",
            DecisionAction::Rotate => "ROTATE",
            DecisionAction::Hold => "HOLD",
        };
        write!(f, "{}", name)
    }
}

/// One action for the cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Action to take
    pub action: DecisionAction,
    /// Symbol acted on; for ROTATE the pair being closed
    #[serde(default)]
    pub asset: Option<String>,
    /// Symbol a ROTATE reopens on, when different from `asset`
    #[serde(default)]
    pub target_asset: Option<String>,
    /// Side to hold on exchange A
    #[serde(default)]
    pub exchange_a_direction: Option<PositionSide>,
    /// Side to hold on exchange B
    #[serde(default)]
    pub exchange_b_direction: Option<PositionSide>,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// Why
    #[serde(default)]
    pub reasoning: String,
}

impl Decision {
    /// Do nothing this cycle
    pub fn hold(reasoning: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Hold,
            asset: None,
            target_asset: None,
            exchange_a_direction: None,
            exchange_b_direction: None,
            confidence: 1.0,
            reasoning: reasoning.into(),
        }
    }

    /// Close the pair on `symbol`
    pub fn close(symbol: &str, reasoning: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Close,
            asset: Some(symbol.to_string()),
            ..Self::hold(reasoning)
        }
    }

    /// Open or rotate along `spread`
    fn along(action: DecisionAction, asset: &str, spread: &Spread, snapshot: &MarketSnapshot, reasoning: String) -> Self {
        Self {
            action,
            asset: Some(asset.to_string()),
            target_asset: (asset != spread.symbol).then(|| spread.symbol.clone()),
            exchange_a_direction: Some(spread.side_on(snapshot.exchange_a)),
            exchange_b_direction: Some(spread.side_on(snapshot.exchange_b)),
            confidence: 1.0,
            reasoning,
        }
    }

    /// Parse an untrusted proposal from JSON
    pub fn from_json(text: &str) -> Result<Self, ArbitrageError> {
        serde_json::from_str(text).map_err(|e| ArbitrageError::Validation(format!("Unparseable proposal: {}", e)))
    }

    /// HOLD, or an asset with (for OPEN/ROTATE) two opposite directions
    pub fn is_valid(&self) -> bool {
        if !(0.0..=1.0).contains(&self.confidence) {
            return false;
        }
        match self.action {
            DecisionAction::Hold => true,
            DecisionAction::Close => self.asset.is_some(),
            DecisionAction::Open | DecisionAction::Rotate => {
                self.asset.is_some()
                    && matches!(
                        (self.exchange_a_direction, self.exchange_b_direction),
                        (Some(a), Some(b)) if a != b
                    )
            }
        }
    }

    /// Symbol the open half trades: `target_asset` if set, else `asset`
    pub fn open_symbol(&self) -> Option<&str> {
        self.target_asset.as_deref().or(self.asset.as_deref())
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action)?;
        if let Some(asset) = &self.asset {
            write!(f, " {}", asset)?;
        }
        if let Some(target) = &self.target_asset {
            write!(f, " -> {}", target)?;
        }
        write!(f, " ({})", self.reasoning)
    }
}

/// Source of untrusted decision proposals
#[async_trait]
pub trait AdvisoryProvider: Send + Sync {
    /// Propose a decision for the snapshot, if any
    async fn propose(&self, snapshot: &MarketSnapshot, positions: &[ArbPosition]) -> Option<Decision>;
}

/// Whether `now` is within `minutes` of the symbol's next funding settlement
pub fn in_settlement_window(snapshot: &MarketSnapshot, symbol: &str, now: DateTime<Utc>, minutes: u64) -> bool {
    snapshot
        .next_settlement(symbol)
        .map_or(false, |settlement| {
            settlement >= now && settlement - now <= Duration::minutes(minutes as i64)
        })
}

/// Rule-based decisions plus validation of external proposals
pub struct DecisionPolicy {
    config: Arc<ArbitrageConfig>,
}

impl DecisionPolicy {
    /// Create a policy
    pub fn new(config: Arc<ArbitrageConfig>) -> Self {
        Self { config }
    }

    /// Decide the cycle's action.
    ///
    /// `excluded` symbols (quarantined) are never opened. A proposal that
    /// fails validation is logged and the rule-based decision is used.
    pub fn decide(
        &self,
        snapshot: &MarketSnapshot,
        positions: &[ArbPosition],
        excluded: &HashSet<String>,
        proposal: Option<&Decision>,
        now: DateTime<Utc>,
    ) -> Decision {
        let rule_based = self.rule_based(snapshot, positions, excluded, now);
        let Some(proposal) = proposal else {
            return rule_based;
        };

        match self.validate_proposal(proposal, snapshot, positions, excluded) {
            Ok(()) => {
                debug!("Accepted advisory proposal: {}", proposal);
                proposal.clone()
            }
            Err(e) => {
                warn!("Advisory proposal rejected, using rule-based {}: {}", rule_based.action, e);
                rule_based
            }
        }
    }

    /// The decision the rules alone produce
    pub fn rule_based(
        &self,
        snapshot: &MarketSnapshot,
        positions: &[ArbPosition],
        excluded: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Decision {
        let strategy = &self.config.strategy;

        for position in positions {
            if let Some(spread) = snapshot.spread(&position.symbol) {
                if spread.annualized_spread < strategy.close_spread_threshold_pct {
                    return Decision::close(
                        &position.symbol,
                        format!(
                            "spread {:.2}% below close threshold {:.2}%",
                            spread.annualized_spread, strategy.close_spread_threshold_pct
                        ),
                    );
                }
            }
        }

        for position in positions {
            let Some(spread) = snapshot.spread(&position.symbol) else {
                continue;
            };
            if spread.short_exchange != position.short_exchange() && spread.is_viable(strategy.min_spread_threshold_pct) {
                return Decision::along(
                    DecisionAction::Rotate,
                    &position.symbol,
                    spread,
                    snapshot,
                    format!("funding differential reversed; {} now pays more", spread.short_exchange),
                );
            }
        }

        let held: f64 = positions.iter().map(|p| p.target_notional_usd).sum();
        let candidate = self.best_candidate(snapshot, positions, excluded);
        if let Some(spread) = candidate {
            if held + strategy.position_size_usd <= strategy.max_total_position_usd {
                return Decision::along(
                    DecisionAction::Open,
                    &spread.symbol,
                    spread,
                    snapshot,
                    format!("annualized spread {:.2}%", spread.annualized_spread),
                );
            }

            let weakest = positions
                .iter()
                .filter_map(|p| snapshot.spread(&p.symbol).map(|s| (p, s.annualized_spread)))
                .min_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((position, annualized)) = weakest {
                if spread.annualized_spread - annualized >= strategy.rotation_improvement_pct {
                    return Decision::along(
                        DecisionAction::Rotate,
                        &position.symbol,
                        spread,
                        snapshot,
                        format!(
                            "{} at {:.2}% beats {} at {:.2}%",
                            spread.symbol, spread.annualized_spread, position.symbol, annualized
                        ),
                    );
                }
            }
        }

        for position in positions {
            if !self.rotation_due(snapshot, position, now) {
                continue;
            }
            if let Some(spread) = snapshot.spread(&position.symbol) {
                return Decision::along(
                    DecisionAction::Rotate,
                    &position.symbol,
                    spread,
                    snapshot,
                    "scheduled volume rotation".to_string(),
                );
            }
        }

        Decision::hold("no action warranted")
    }

    /// Whether a held pair is due for a volume rotation this cycle
    pub fn rotation_due(&self, snapshot: &MarketSnapshot, position: &ArbPosition, now: DateTime<Utc>) -> bool {
        let strategy = &self.config.strategy;
        now >= position.next_rotation_at
            && snapshot.is_safe(&position.symbol)
            && snapshot
                .spread(&position.symbol)
                .map_or(false, |s| s.is_viable(strategy.min_spread_threshold_pct))
            && !in_settlement_window(snapshot, &position.symbol, now, strategy.settlement_protection_minutes)
    }

    /// Check an external proposal against the snapshot
    pub fn validate_proposal(
        &self,
        proposal: &Decision,
        snapshot: &MarketSnapshot,
        positions: &[ArbPosition],
        excluded: &HashSet<String>,
    ) -> Result<(), ArbitrageError> {
        let reject = |reason: String| Err(ArbitrageError::Validation(reason));

        if proposal.action == DecisionAction::Hold {
            return reject("HOLD proposals do not override rule-based decisions".to_string());
        }
        if !proposal.is_valid() {
            return reject(format!("malformed {} proposal", proposal.action));
        }
        if proposal.confidence < self.config.strategy.min_confidence {
            return reject(format!(
                "confidence {:.2} below minimum {:.2}",
                proposal.confidence, self.config.strategy.min_confidence
            ));
        }

        let asset = proposal.asset.as_deref().unwrap_or_default();
        if snapshot.spread(asset).is_none() {
            return reject(format!("{} is not in the spread set", asset));
        }
        let held = |symbol: &str| positions.iter().any(|p| p.symbol == symbol);

        match proposal.action {
            DecisionAction::Close => {
                if !held(asset) {
                    return reject(format!("CLOSE {} without a held pair", asset));
                }
            }
            DecisionAction::Open | DecisionAction::Rotate => {
                if proposal.action == DecisionAction::Open && held(asset) {
                    return reject(format!("OPEN {} while a pair is held", asset));
                }
                if proposal.action == DecisionAction::Rotate && !held(asset) {
                    return reject(format!("ROTATE {} without a held pair", asset));
                }
                let target = proposal.open_symbol().unwrap_or(asset);
                if excluded.contains(target) {
                    return reject(format!("{} is quarantined", target));
                }
                let Some(spread) = snapshot.spread(target) else {
                    return reject(format!("{} is not in the spread set", target));
                };
                let expected = (
                    Some(spread.side_on(snapshot.exchange_a)),
                    Some(spread.side_on(snapshot.exchange_b)),
                );
                if (proposal.exchange_a_direction, proposal.exchange_b_direction) != expected {
                    return reject(format!(
                        "directions disagree with data: {} should be short on {}",
                        target, spread.short_exchange
                    ));
                }
            }
            DecisionAction::Hold => {}
        }
        Ok(())
    }

    /// Highest viable, safe, unheld, non-excluded spread
    fn best_candidate<'a>(
        &self,
        snapshot: &'a MarketSnapshot,
        positions: &[ArbPosition],
        excluded: &HashSet<String>,
    ) -> Option<&'a Spread> {
        snapshot
            .spreads
            .values()
            .filter(|s| s.is_viable(self.config.strategy.min_spread_threshold_pct))
            .filter(|s| snapshot.is_safe(&s.symbol))
            .filter(|s| !excluded.contains(&s.symbol))
            .filter(|s| !positions.iter().any(|p| p.symbol == s.symbol))
            .max_by(|a, b| a.annualized_spread.total_cmp(&b.annualized_spread))
    }
}
