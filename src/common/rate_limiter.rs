//! Per-endpoint-class rate limiting using the token bucket algorithm.
//!
//! The venue documents separate rate limits for order placement, RFQ,
//! account/position polling, and market data — hammering the order
//! endpoint should never starve an unrelated orderbook poll of its own
//! budget, so each [`RequestClass`] gets its own bucket rather than one
//! limiter shared across every call the transport makes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

/// The venue's documented rate-limit categories. Order placement and RFQ
/// calls are the tightest-limited and most failure-sensitive; market data
/// and account polling have more headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Order,
    Rfq,
    Account,
    MarketData,
}

/// Per-class token bucket configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClassLimit {
    pub max_requests_per_second: usize,
    pub refill_interval: Duration,
}

impl ClassLimit {
    pub fn new(max_requests_per_second: usize, refill_interval: Duration) -> Self {
        Self { max_requests_per_second, refill_interval }
    }
}

/// Configuration for the whole venue rate limiter: one [`ClassLimit`] per
/// [`RequestClass`]. Defaults reflect a typical options venue's documented
/// limits — tight on order/RFQ, loose on read-only polling.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    limits: HashMap<RequestClass, ClassLimit>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        let mut limits = HashMap::new();
        limits.insert(RequestClass::Order, ClassLimit::new(5, Duration::from_secs(1)));
        limits.insert(RequestClass::Rfq, ClassLimit::new(3, Duration::from_secs(1)));
        limits.insert(RequestClass::Account, ClassLimit::new(10, Duration::from_secs(1)));
        limits.insert(RequestClass::MarketData, ClassLimit::new(20, Duration::from_secs(1)));
        Self { limits }
    }
}

impl RateLimiterConfig {
    /// Overrides the limit for a single class, leaving the others at their
    /// defaults.
    pub fn with_class_limit(mut self, class: RequestClass, limit: ClassLimit) -> Self {
        self.limits.insert(class, limit);
        self
    }

    fn limit_for(&self, class: RequestClass) -> ClassLimit {
        self.limits.get(&class).copied().unwrap_or(ClassLimit::new(5, Duration::from_secs(1)))
    }
}

/// Single-class token bucket. Kept private — callers go through
/// [`RateLimiter::acquire`] with a [`RequestClass`], never this directly.
#[derive(Debug)]
struct ClassBucket {
    permits: Arc<Semaphore>,
    max_permits: usize,
    last_refill: Arc<Mutex<Instant>>,
    refill_interval: Duration,
}

impl ClassBucket {
    fn new(limit: ClassLimit) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max_requests_per_second)),
            max_permits: limit.max_requests_per_second,
            last_refill: Arc::new(Mutex::new(Instant::now())),
            refill_interval: limit.refill_interval,
        }
    }

    async fn acquire(&self) {
        self.try_refill().await;
        let permit = self.permits.acquire().await.expect("semaphore should not be closed");
        permit.forget();
    }

    async fn try_acquire(&self) -> bool {
        self.try_refill().await;
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn try_refill(&self) {
        let mut last_refill = self.last_refill.lock().await;
        let elapsed = last_refill.elapsed();

        if elapsed >= self.refill_interval {
            let intervals = (elapsed.as_millis() / self.refill_interval.as_millis()) as usize;
            let permits_to_add = intervals * self.max_permits;
            let current = self.permits.available_permits();
            let to_add = permits_to_add.min(self.max_permits.saturating_sub(current));
            if to_add > 0 {
                self.permits.add_permits(to_add);
            }
            *last_refill = Instant::now();
        }
    }
}

/// Rate limiter with one independent token bucket per [`RequestClass`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<HashMap<RequestClass, ClassBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let buckets = [RequestClass::Order, RequestClass::Rfq, RequestClass::Account, RequestClass::MarketData]
            .into_iter()
            .map(|class| (class, ClassBucket::new(config.limit_for(class))))
            .collect();
        Self { buckets: Arc::new(buckets) }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// Acquire a permit in `class`'s bucket, waiting if it's exhausted.
    pub async fn acquire(&self, class: RequestClass) {
        self.buckets[&class].acquire().await;
    }

    /// Try to acquire a permit in `class`'s bucket without blocking.
    pub async fn try_acquire(&self, class: RequestClass) -> bool {
        self.buckets[&class].try_acquire().await
    }

    /// Available permits remaining in `class`'s bucket.
    pub fn available_permits(&self, class: RequestClass) -> usize {
        self.buckets[&class].available_permits()
    }
}
