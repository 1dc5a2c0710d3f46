//! Settings management utilities

use crate::{ArbitrageError, Result};
use std::env;

/// Environment variable expansion utility
pub struct EnvExpander;

impl EnvExpander {
    /// Expand `${VAR_NAME}` references in a string
    pub fn expand(input: &str) -> Result<String> {
        let mut result = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                ArbitrageError::Config("Unclosed environment variable reference".to_string())
            })?;

            let var_name = &after[..end];
            let var_value = env::var(var_name).map_err(|_| {
                ArbitrageError::Config(format!("Environment variable '{}' not found", var_name))
            })?;
            result.push_str(&var_value);
            rest = &after[end + 1..];
        }

        result.push_str(rest);
        Ok(result)
    }

    /// Whether the string contains a `${...}` reference
    pub fn has_reference(input: &str) -> bool {
        input.contains("${")
    }
}

/// Configuration validation utilities
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate a canonical symbol (base asset such as `BTC`)
    pub fn validate_symbol(symbol: &str) -> Result<()> {
        if symbol.is_empty() {
            return Err(ArbitrageError::Config("Symbol cannot be empty".to_string()).into());
        }

        if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ArbitrageError::Config(format!(
                "Symbol '{}' must contain only alphanumeric characters",
                symbol
            ))
            .into());
        }

        Ok(())
    }

    /// Validate a fraction value (0.0 to 1.0)
    pub fn validate_fraction(value: f64, name: &str) -> Result<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(
                ArbitrageError::Config(format!("{} must be between 0.0 and 1.0", name)).into(),
            );
        }
        Ok(())
    }

    /// Validate a positive value
    pub fn validate_positive(value: f64, name: &str) -> Result<()> {
        if value <= 0.0 || !value.is_finite() {
            return Err(ArbitrageError::Config(format!("{} must be positive", name)).into());
        }
        Ok(())
    }

    /// Validate a URL format
    pub fn validate_url(url: &str, name: &str) -> Result<()> {
        if url.is_empty() {
            return Err(ArbitrageError::Config(format!("{} cannot be empty", name)).into());
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ArbitrageError::Config(format!("{} must be a valid URL", name)).into());
        }

        url::Url::parse(url)
            .map_err(|e| ArbitrageError::Config(format!("{} is not a valid URL: {}", name, e)))?;

        Ok(())
    }
}

/// Configuration defaults
pub struct ConfigDefaults;

impl ConfigDefaults {
    /// Seconds between scan cycles
    pub const SCAN_INTERVAL_SECS: u64 = 60;

    /// Seconds between volume rotations of a held pair
    pub const ROTATION_INTERVAL_SECS: u64 = 3600;

    /// Upper bound of the random delay added to each rotation deadline
    pub const ROTATION_JITTER_SECS: u64 = 300;

    /// Per-leg notional in USD
    pub const POSITION_SIZE_USD: f64 = 100.0;

    /// Cap on the summed per-leg notional of all pairs
    pub const MAX_TOTAL_POSITION_USD: f64 = 1000.0;

    /// Annualized spread (percent) required to open
    pub const MIN_SPREAD_THRESHOLD_PCT: f64 = 5.0;

    /// Annualized spread (percent) below which a pair is closed
    pub const CLOSE_SPREAD_THRESHOLD_PCT: f64 = 1.0;

    /// Extra annualized spread (percent) needed to move a pair to another symbol
    pub const ROTATION_IMPROVEMENT_PCT: f64 = 5.0;

    /// Minutes before a funding settlement during which rotations are held back
    pub const SETTLEMENT_PROTECTION_MINUTES: u64 = 10;

    /// Hours between funding settlements
    pub const FUNDING_INTERVAL_HOURS: f64 = 8.0;

    /// Minimum confidence accepted from an advisory proposal
    pub const MIN_CONFIDENCE: f64 = 0.6;

    /// Paper balance per venue in dry-run mode
    pub const PAPER_BALANCE_USD: f64 = 10_000.0;

    /// Absolute leg imbalance (USD) that forces a rotation
    pub const MAX_DELTA_IMBALANCE_USD: f64 = 20.0;

    /// Relative leg imbalance tolerated after an open
    pub const BALANCE_TOLERANCE: f64 = 0.10;

    /// Rolling volatility (percent) above which trading pauses
    pub const MAX_VOLATILITY_PCT: f64 = 2.0;

    /// Rolling volatility window in seconds
    pub const VOLATILITY_WINDOW_SECS: u64 = 3600;

    /// Smallest per-leg notional worth trading
    pub const MIN_POSITION_USD: f64 = 10.0;

    /// Fraction of the smaller available balance usable per leg
    pub const MAX_POSITION_FRACTION: f64 = 0.5;

    /// Consecutive failed executions before the failure breaker trips
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

    /// Cooldown between trades on the same symbol
    pub const MIN_TRADE_INTERVAL_SECS: u64 = 300;

    /// Per-request timeout in milliseconds
    pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

    /// Attempts for idempotent requests
    pub const MAX_RETRY_ATTEMPTS: u32 = 3;

    /// First retry backoff in milliseconds
    pub const RETRY_BACKOFF_MS: u64 = 500;

    /// Retry backoff ceiling in milliseconds
    pub const MAX_RETRY_BACKOFF_MS: u64 = 5_000;

    /// Requests per second allowed per venue
    pub const REQUESTS_PER_SECOND: u32 = 10;

    /// Receive window for signed requests in milliseconds
    pub const RECV_WINDOW_MS: u64 = 5_000;
}
