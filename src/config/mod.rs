//! Configuration management module

pub mod settings;

pub use settings::*;

use crate::{connectors::Exchange, ArbitrageError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Prefix for environment overrides, e.g. `FUNDING_ARB__STRATEGY__DRY_RUN=false`
pub const ENV_PREFIX: &str = "FUNDING_ARB";

/// Main configuration structure for the arbitrage system
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrageConfig {
    /// Strategy configuration
    pub strategy: StrategyConfig,
    /// Risk management configuration
    pub risk: RiskConfig,
    /// Execution configuration
    pub execution: ExecutionConfig,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
    /// Exchange configuration
    pub exchanges: ExchangeListConfig,
}

/// Strategy-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Canonical symbols (base assets) traded on both venues
    pub symbols: Vec<String>,
    /// Seconds between scan cycles
    pub scan_interval_seconds: u64,
    /// Seconds between volume rotations of a held pair
    pub rotation_interval_seconds: u64,
    /// Maximum random delay added to each rotation deadline
    pub rotation_jitter_seconds: u64,
    /// Per-leg notional in USD
    pub position_size_usd: f64,
    /// Cap on the summed per-leg notional across all pairs
    pub max_total_position_usd: f64,
    /// Annualized spread (percent) required to open
    pub min_spread_threshold_pct: f64,
    /// Annualized spread (percent) below which a held pair is closed
    pub close_spread_threshold_pct: f64,
    /// Extra annualized spread (percent) required to move a pair to a better symbol
    pub rotation_improvement_pct: f64,
    /// Minutes before a funding settlement during which rotations are held back
    pub settlement_protection_minutes: u64,
    /// Hours between funding settlements on both venues
    pub funding_interval_hours: f64,
    /// Minimum confidence accepted from an advisory proposal
    pub min_confidence: f64,
    /// Simulate fills instead of sending orders
    pub dry_run: bool,
    /// Paper balance per venue in dry-run mode
    pub paper_balance_usd: f64,
    /// Keep pairs open when the engine stops
    pub leave_positions_open_on_shutdown: bool,
}

/// Risk management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Absolute leg imbalance (USD) that forces a rotation
    pub max_delta_imbalance_usd: f64,
    /// Relative leg imbalance tolerated for a delta-neutral pair
    pub balance_tolerance: f64,
    /// Rolling volatility (percent) at or above which trading is blocked
    pub max_volatility_pct: f64,
    /// Rolling volatility window in seconds
    pub volatility_window_seconds: u64,
    /// Smallest per-leg notional worth trading
    pub min_position_usd: f64,
    /// Fraction of the smaller available balance usable per leg
    pub max_position_fraction: f64,
    /// Consecutive failed executions before trading pauses
    pub max_consecutive_failures: u32,
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Cooldown between opens/rotations on the same symbol
    pub min_trade_interval_seconds: u64,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Attempts for idempotent requests
    pub max_retry_attempts: u32,
    /// First retry backoff in milliseconds
    pub retry_backoff_ms: u64,
    /// Retry backoff ceiling in milliseconds
    pub max_retry_backoff_ms: u64,
    /// Requests per second allowed per venue
    pub requests_per_second: u32,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Enable metrics collection and the Prometheus endpoint
    pub enable_metrics: bool,
    /// Listen address of the Prometheus endpoint
    pub metrics_listen_addr: String,
    /// Log a full status block every N cycles
    pub status_log_interval_cycles: u64,
}

/// Exchange list configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeListConfig {
    /// Venue reported as "exchange A"
    pub venue_a: Exchange,
    /// Venue reported as "exchange B"
    pub venue_b: Exchange,
    /// Quote asset appended to canonical symbols
    pub quote_asset: String,
    /// Binance USDⓈ-M futures settings
    pub binance: ExchangeConfig,
    /// Bybit linear perpetual settings
    pub bybit: ExchangeConfig,
}

/// Individual exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// REST API URL
    pub rest_api_url: String,
    /// API key
    pub api_key: String,
    /// Secret key
    pub secret_key: String,
    /// Use the testnet endpoint
    pub testnet: bool,
    /// Testnet REST API URL
    pub testnet_rest_api_url: Option<String>,
    /// Receive window for signed requests in milliseconds
    pub recv_window_ms: u64,
}

impl ArbitrageConfig {
    /// Load configuration from a TOML file, applying `FUNDING_ARB__*` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ArbitrageError::Config(format!(
                "Config file not found: {}",
                path.display()
            ))
            .into());
        }

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ArbitrageError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: ArbitrageConfig = settings
            .try_deserialize()
            .map_err(|e| ArbitrageError::Config(format!("Failed to parse config: {}", e)))?;

        config.expand_env_vars()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let s = &self.strategy;
        let r = &self.risk;
        let e = &self.execution;

        if s.symbols.is_empty() {
            return Err(ArbitrageError::Config("At least one symbol is required".to_string()).into());
        }
        for symbol in &s.symbols {
            ConfigValidator::validate_symbol(symbol)?;
        }

        if self.exchanges.venue_a == self.exchanges.venue_b {
            return Err(ArbitrageError::Config(
                "Two distinct exchanges are required for arbitrage".to_string(),
            )
            .into());
        }
        ConfigValidator::validate_symbol(&self.exchanges.quote_asset)?;

        if s.scan_interval_seconds == 0 {
            return Err(ArbitrageError::Config("Scan interval must be greater than 0".to_string()).into());
        }
        if s.rotation_interval_seconds == 0 {
            return Err(
                ArbitrageError::Config("Rotation interval must be greater than 0".to_string()).into(),
            );
        }

        ConfigValidator::validate_positive(s.position_size_usd, "position_size_usd")?;
        ConfigValidator::validate_positive(s.max_total_position_usd, "max_total_position_usd")?;
        if s.max_total_position_usd < s.position_size_usd {
            return Err(ArbitrageError::Config(
                "max_total_position_usd must be at least position_size_usd".to_string(),
            )
            .into());
        }

        ConfigValidator::validate_positive(s.min_spread_threshold_pct, "min_spread_threshold_pct")?;
        if s.close_spread_threshold_pct < 0.0 || s.close_spread_threshold_pct >= s.min_spread_threshold_pct {
            return Err(ArbitrageError::Config(
                "close_spread_threshold_pct must be in [0, min_spread_threshold_pct)".to_string(),
            )
            .into());
        }
        if s.rotation_improvement_pct < 0.0 {
            return Err(
                ArbitrageError::Config("rotation_improvement_pct cannot be negative".to_string()).into(),
            );
        }
        ConfigValidator::validate_positive(s.funding_interval_hours, "funding_interval_hours")?;
        ConfigValidator::validate_fraction(s.min_confidence, "min_confidence")?;
        if s.dry_run {
            ConfigValidator::validate_positive(s.paper_balance_usd, "paper_balance_usd")?;
        }

        ConfigValidator::validate_positive(r.max_delta_imbalance_usd, "max_delta_imbalance_usd")?;
        ConfigValidator::validate_positive(r.balance_tolerance, "balance_tolerance")?;
        ConfigValidator::validate_fraction(r.balance_tolerance, "balance_tolerance")?;
        ConfigValidator::validate_positive(r.max_volatility_pct, "max_volatility_pct")?;
        ConfigValidator::validate_positive(r.min_position_usd, "min_position_usd")?;
        ConfigValidator::validate_positive(r.max_position_fraction, "max_position_fraction")?;
        if r.min_position_usd > s.position_size_usd {
            return Err(ArbitrageError::Config(
                "min_position_usd cannot exceed position_size_usd".to_string(),
            )
            .into());
        }
        if r.volatility_window_seconds == 0 {
            return Err(
                ArbitrageError::Config("Volatility window must be greater than 0".to_string()).into(),
            );
        }
        if r.max_consecutive_failures == 0 {
            return Err(ArbitrageError::Config(
                "max_consecutive_failures must be at least 1".to_string(),
            )
            .into());
        }

        if e.request_timeout_ms == 0 {
            return Err(ArbitrageError::Config("Request timeout must be greater than 0".to_string()).into());
        }
        if e.max_retry_attempts == 0 {
            return Err(ArbitrageError::Config("max_retry_attempts must be at least 1".to_string()).into());
        }
        if e.requests_per_second == 0 {
            return Err(
                ArbitrageError::Config("requests_per_second must be at least 1".to_string()).into(),
            );
        }

        for exchange in [self.exchanges.venue_a, self.exchanges.venue_b] {
            let venue = self.exchanges.venue(exchange);
            ConfigValidator::validate_url(venue.base_url(), &format!("{} rest_api_url", exchange))?;
            if !s.dry_run && (venue.api_key.is_empty() || venue.secret_key.is_empty()) {
                return Err(ArbitrageError::Config(format!(
                    "API credentials for {} are required for live trading",
                    exchange
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Expand `${VAR}` references in credentials
    fn expand_env_vars(&mut self) -> Result<()> {
        let dry_run = self.strategy.dry_run;
        for venue in [&mut self.exchanges.binance, &mut self.exchanges.bybit] {
            for field in [&mut venue.api_key, &mut venue.secret_key] {
                if !EnvExpander::has_reference(field) {
                    continue;
                }
                match EnvExpander::expand(field) {
                    Ok(value) => *field = value,
                    // Dry runs only touch public endpoints.
                    Err(e) if dry_run => {
                        warn!("Leaving credential unset in dry-run mode: {}", e);
                        field.clear();
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Interval between scan cycles
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.strategy.scan_interval_seconds)
    }

    /// Funding settlements per year, derived from the settlement interval
    pub fn periods_per_year(&self) -> f64 {
        (24.0 / self.strategy.funding_interval_hours) * 365.0
    }
}

impl ExchangeListConfig {
    /// Settings of the given venue
    pub fn venue(&self, exchange: Exchange) -> &ExchangeConfig {
        match exchange {
            Exchange::Binance => &self.binance,
            Exchange::Bybit => &self.bybit,
        }
    }
}

impl ExchangeConfig {
    /// Endpoint used for REST calls, honouring the testnet switch
    pub fn base_url(&self) -> &str {
        if self.testnet {
            self.testnet_rest_api_url.as_deref().unwrap_or(&self.rest_api_url)
        } else {
            &self.rest_api_url
        }
    }

    fn with_url(rest_api_url: &str, testnet_rest_api_url: &str) -> Self {
        Self {
            rest_api_url: rest_api_url.to_string(),
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            testnet_rest_api_url: Some(testnet_rest_api_url.to_string()),
            recv_window_ms: ConfigDefaults::RECV_WINDOW_MS,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()],
            scan_interval_seconds: ConfigDefaults::SCAN_INTERVAL_SECS,
            rotation_interval_seconds: ConfigDefaults::ROTATION_INTERVAL_SECS,
            rotation_jitter_seconds: ConfigDefaults::ROTATION_JITTER_SECS,
            position_size_usd: ConfigDefaults::POSITION_SIZE_USD,
            max_total_position_usd: ConfigDefaults::MAX_TOTAL_POSITION_USD,
            min_spread_threshold_pct: ConfigDefaults::MIN_SPREAD_THRESHOLD_PCT,
            close_spread_threshold_pct: ConfigDefaults::CLOSE_SPREAD_THRESHOLD_PCT,
            rotation_improvement_pct: ConfigDefaults::ROTATION_IMPROVEMENT_PCT,
            settlement_protection_minutes: ConfigDefaults::SETTLEMENT_PROTECTION_MINUTES,
            funding_interval_hours: ConfigDefaults::FUNDING_INTERVAL_HOURS,
            min_confidence: ConfigDefaults::MIN_CONFIDENCE,
            dry_run: true,
            paper_balance_usd: ConfigDefaults::PAPER_BALANCE_USD,
            leave_positions_open_on_shutdown: true,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_delta_imbalance_usd: ConfigDefaults::MAX_DELTA_IMBALANCE_USD,
            balance_tolerance: ConfigDefaults::BALANCE_TOLERANCE,
            max_volatility_pct: ConfigDefaults::MAX_VOLATILITY_PCT,
            volatility_window_seconds: ConfigDefaults::VOLATILITY_WINDOW_SECS,
            min_position_usd: ConfigDefaults::MIN_POSITION_USD,
            max_position_fraction: ConfigDefaults::MAX_POSITION_FRACTION,
            max_consecutive_failures: ConfigDefaults::MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_trade_interval_seconds: ConfigDefaults::MIN_TRADE_INTERVAL_SECS,
            request_timeout_ms: ConfigDefaults::REQUEST_TIMEOUT_MS,
            max_retry_attempts: ConfigDefaults::MAX_RETRY_ATTEMPTS,
            retry_backoff_ms: ConfigDefaults::RETRY_BACKOFF_MS,
            max_retry_backoff_ms: ConfigDefaults::MAX_RETRY_BACKOFF_MS,
            requests_per_second: ConfigDefaults::REQUESTS_PER_SECOND,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_listen_addr: "127.0.0.1:9090".to_string(),
            status_log_interval_cycles: 10,
        }
    }
}

impl Default for ExchangeListConfig {
    fn default() -> Self {
        Self {
            venue_a: Exchange::Binance,
            venue_b: Exchange::Bybit,
            quote_asset: "USDT".to_string(),
            binance: ExchangeConfig::with_url(
                "https://fapi.binance.com",
                "https://testnet.binancefuture.com",
            ),
            bybit: ExchangeConfig::with_url("https://api.bybit.com", "https://api-testnet.bybit.com"),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self::with_url("https://localhost", "https://localhost")
    }
}
