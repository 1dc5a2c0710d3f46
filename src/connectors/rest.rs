//! Shared REST plumbing: request throttling, retries and request signing

use crate::{config::ExecutionConfig, ArbitrageError, Result};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Longest response body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Per-venue request budget shared by every call an adapter makes
pub struct RequestThrottle {
    limiter: DirectLimiter,
}

impl RequestThrottle {
    /// Allow `requests_per_second` requests, at least one
    pub fn per_second(requests_per_second: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        }
    }

    /// Wait until the next request may be sent
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

/// Exponential backoff for idempotent requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Build a policy
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Policy from execution settings
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            Duration::from_millis(config.retry_backoff_ms),
            Duration::from_millis(config.max_retry_backoff_ms),
        )
    }

    /// One attempt, no retries. Used for order placement.
    pub fn single() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Run `op`, retrying transient failures
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && is_transient(&e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether an error is worth another attempt
pub fn is_transient(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ArbitrageError>()
        .map(ArbitrageError::is_transient)
        .unwrap_or(false)
}

/// HTTP client bound to one venue's base URL
pub struct RestClient {
    base_url: String,
    http: Client,
    throttle: Arc<RequestThrottle>,
    retry: RetryPolicy,
}

impl RestClient {
    /// Build a client; performs no network I/O
    pub fn new(base_url: &str, config: &ExecutionConfig, throttle: Arc<RequestThrottle>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ArbitrageError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            throttle,
            retry: RetryPolicy::from_config(config),
        })
    }

    /// Venue base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a request to `path_and_query` under the base URL
    pub fn request(&self, method: Method, path_and_query: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{}", self.base_url, path_and_query))
    }

    /// Send a request and decode the JSON body.
    ///
    /// `build` runs once per attempt so signed requests get a fresh
    /// timestamp. Only `idempotent` requests are retried.
    pub async fn send_json<T, F>(&self, what: &str, idempotent: bool, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> Result<RequestBuilder>,
    {
        let policy = if idempotent {
            self.retry.clone()
        } else {
            RetryPolicy::single()
        };
        let build = &build;
        policy
            .run(what, move || async move { self.send_once(what, build()?).await })
            .await
    }

    async fn send_once<T: DeserializeOwned>(&self, what: &str, request: RequestBuilder) -> Result<T> {
        self.throttle.acquire().await;
        debug!("{}: sending request", what);

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport_error)?;

        if !status.is_success() {
            return Err(ArbitrageError::Exchange {
                status: status.as_u16(),
                message: truncate(&body),
            }
            .into());
        }

        serde_json::from_str(&body).map_err(|e| {
            ArbitrageError::DataParsing(format!("{}: {} (body: {})", what, e, truncate(&body))).into()
        })
    }
}

fn classify_transport_error(e: reqwest::Error) -> ArbitrageError {
    if e.is_timeout() {
        ArbitrageError::Timeout(e.to_string())
    } else {
        ArbitrageError::Connection(e.to_string())
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Hex-encoded HMAC-SHA256 of `payload` under `secret`
pub fn sign_hmac_sha256(secret: &str, payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ArbitrageError::Config(format!("Invalid signing key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
