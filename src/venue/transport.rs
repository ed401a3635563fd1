//! Generic venue transport contract and a concrete HTTP implementation.
//!
//! The core (executors, fill manager, poller) only ever depends on the
//! [`VenueTransport`] trait — signing, retries, rate limiting, and circuit
//! breaking are the transport's concern, not the trading logic's. This
//! mirrors `rust/src/coindcx/client.rs`'s `execute_with_retry`, generalized
//! from CoinDCX-specific endpoints to the generic method/path/body contract
//! §6 describes.

use crate::common::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig, RequestClass};
use crate::error::{CoreError, CoreResult};
use crate::venue::auth::Credentials;
use crate::venue::types::TransportResponse;
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// The core's only dependency on the outside world for order/RFQ/account
/// calls. Implementors own signing, retries, and transport-level timeouts.
#[async_trait]
pub trait VenueTransport: Send + Sync {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        json_body: Option<Value>,
        form_body: Option<Value>,
    ) -> CoreResult<TransportResponse>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub max_retries: u32,
    pub timeout: Duration,
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.venue.example".to_string(),
            max_retries: 3,
            timeout: Duration::from_secs(30),
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Production HTTP implementation of [`VenueTransport`].
///
/// Retries only transient errors (connection reset, timeout, DNS) with
/// exponential backoff + jitter (1s/2s/4s ±10%, §5); 4xx/5xx venue
/// rejections surface immediately as `CoreError::VenueRejected` so callers
/// can decide whether to retry, fall back, or fail the trade.
pub struct HttpVenueTransport {
    credentials: Credentials,
    http: Client,
    base_url: String,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
    rate_limiter: RateLimiter,
    max_retries: u32,
}

impl HttpVenueTransport {
    pub fn new(credentials: Credentials, config: ClientConfig) -> Self {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("failed to build HTTP client");

        Self {
            credentials,
            http,
            base_url: config.base_url,
            circuit_breaker: Arc::new(Mutex::new(CircuitBreaker::new(config.circuit_breaker))),
            rate_limiter: RateLimiter::new(config.rate_limiter),
            max_retries: config.max_retries,
        }
    }

    async fn send_once(
        &self,
        method: HttpMethod,
        path: &str,
        json_body: Option<&Value>,
        form_body: Option<&Value>,
    ) -> CoreResult<TransportResponse> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = match method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url),
        };

        builder = builder.header("X-AUTH-APIKEY", self.credentials.api_key());

        if let Some(body) = json_body {
            let payload = serde_json::to_string(body)
                .map_err(|e| CoreError::Transport(format!("encode json body: {e}")))?;
            let signature = self.credentials.sign(&payload);
            builder = builder
                .header("Content-Type", "application/json")
                .header("X-AUTH-SIGNATURE", signature)
                .body(payload);
        } else if let Some(form) = form_body {
            let pairs: Vec<(String, String)> = form
                .as_object()
                .into_iter()
                .flat_map(|obj| obj.iter())
                .map(|(k, v)| (k.clone(), value_to_form_string(v)))
                .collect();
            let encoded = serde_urlencoded::to_string(&pairs)
                .map_err(|e| CoreError::Transport(format!("encode form body: {e}")))?;
            let signature = self.credentials.sign(&encoded);
            builder = builder
                .header("Content-Type", "application/x-www-form-urlencoded")
                .header("X-AUTH-SIGNATURE", signature)
                .body(encoded);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::Transport(format!("read response body: {e}")))?;

        if !status.is_success() {
            return Err(CoreError::VenueRejected(format!("http {status}: {text}")));
        }

        serde_json::from_str(&text)
            .map_err(|e| CoreError::Transport(format!("parse response: {e} (body: {text})")))
    }
}

fn value_to_form_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Classifies a request path into the venue's documented rate-limit
/// category so each gets its own budget (§5).
fn classify(path: &str) -> RequestClass {
    let path_only = path.split('?').next().unwrap_or(path);
    if path_only.contains("/rfq/") {
        RequestClass::Rfq
    } else if path_only.contains("/order/") {
        RequestClass::Order
    } else if path_only == "/positions" || path_only.starts_with("/account/") {
        RequestClass::Account
    } else {
        RequestClass::MarketData
    }
}

#[async_trait]
impl VenueTransport for HttpVenueTransport {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        json_body: Option<Value>,
        form_body: Option<Value>,
    ) -> CoreResult<TransportResponse> {
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.can_attempt() {
                return Err(CoreError::Transport("circuit breaker open".to_string()));
            }
        }

        self.rate_limiter.acquire(classify(path)).await;

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let base_ms = 1000u64 * 2u64.pow(attempt - 1);
                let jitter_frac = rand::thread_rng().gen_range(-0.1..=0.1);
                let delay_ms = (base_ms as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
                tracing::debug!(delay_ms, attempt, "retrying venue request");
                sleep(Duration::from_millis(delay_ms)).await;
            }

            match self
                .send_once(method, path, json_body.as_ref(), form_body.as_ref())
                .await
            {
                Ok(resp) => {
                    let mut cb = self.circuit_breaker.lock().await;
                    cb.record_success();
                    return Ok(resp);
                }
                Err(e @ CoreError::VenueRejected(_)) => {
                    // Not transient — don't retry, don't trip the breaker.
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "transient venue transport error");
                    last_err = Some(e);
                }
            }
        }

        let mut cb = self.circuit_breaker.lock().await;
        cb.record_failure();
        Err(last_err.unwrap_or_else(|| CoreError::Transport("request failed".to_string())))
    }
}
