//! Rolling mark-price volatility

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::VecDeque;

/// Volatility of one symbol at snapshot time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolatilityReading {
    /// Coefficient of variation in percent; `None` without samples
    pub volatility_pct: Option<f64>,
    /// Below the configured ceiling. Unknown volatility is never safe.
    pub is_safe: bool,
    /// Samples inside the window
    pub samples: usize,
}

impl VolatilityReading {
    /// A reading with no data
    pub fn unknown() -> Self {
        Self {
            volatility_pct: None,
            is_safe: false,
            samples: 0,
        }
    }
}

/// Time-windowed mark price samples
#[derive(Debug, Clone)]
pub struct PriceHistory {
    window: Duration,
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl PriceHistory {
    /// History keeping `window_seconds` of samples
    pub fn new(window_seconds: u64) -> Self {
        Self {
            window: Duration::seconds(window_seconds as i64),
            samples: VecDeque::new(),
        }
    }

    /// Add a sample and drop those older than the window
    pub fn record(&mut self, at: DateTime<Utc>, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.samples.push_back((at, price));
        }
        self.prune(at);
    }

    /// Drop samples older than the window relative to `now`
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while matches!(self.samples.front(), Some((at, _)) if *at < cutoff) {
            self.samples.pop_front();
        }
    }

    /// Samples held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are held
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Population standard deviation over mean, in percent
    pub fn volatility_pct(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mean = self.samples.iter().map(|(_, p)| *p).mean();
        let std_dev = self.samples.iter().map(|(_, p)| *p).population_std_dev();
        let pct = std_dev / mean * 100.0;
        pct.is_finite().then_some(pct)
    }

    /// Reading against a volatility ceiling
    pub fn reading(&self, max_volatility_pct: f64) -> VolatilityReading {
        let volatility_pct = self.volatility_pct();
        VolatilityReading {
            volatility_pct,
            is_safe: volatility_pct.map_or(false, |v| v < max_volatility_pct),
            samples: self.samples.len(),
        }
    }
}
