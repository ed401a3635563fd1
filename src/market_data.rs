//! Market-data source contract and a cached HTTP implementation.
//!
//! Grounded on `src/coindcx/client.rs::get_orderbook` for the request shape,
//! generalized from CoinDCX's public market-data endpoints to the venue's
//! options-chain endpoints described in §6. Option-chain *selection*
//! (picking a strike/expiry by delta) stays out of this module — it is the
//! external collaborator in `strategy::selection`; this module only reports
//! what the venue publishes.

use crate::error::{CoreError, CoreResult};
use crate::types::{Greeks, Symbol};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Deserialize)]
pub struct BookLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
}

/// A venue orderbook snapshot. Bids sorted descending, asks ascending, per §6.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Orderbook {
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
    #[serde(default)]
    pub mark: Option<Decimal>,
}

impl Orderbook {
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }
}

/// Per-contract Greeks and quote, per §6's "get option details".
#[derive(Debug, Clone, Deserialize)]
pub struct OptionDetails {
    pub greeks: Greeks,
    pub mark: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(rename = "iv")]
    pub implied_volatility: Decimal,
}

/// One listed contract in an underlying's option chain.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: Symbol,
    pub strike: Decimal,
    #[serde(rename = "expiryTime")]
    pub expiry_time_ms: i64,
    #[serde(rename = "optionType")]
    pub option_type: String,
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn get_orderbook(&self, symbol: &Symbol) -> CoreResult<Option<Orderbook>>;
    async fn get_option_details(&self, symbol: &Symbol) -> CoreResult<Option<OptionDetails>>;
    async fn get_instruments(&self, underlying: &str) -> CoreResult<Vec<InstrumentInfo>>;
    async fn get_futures_price(&self, underlying: &str, use_cache: bool) -> CoreResult<Decimal>;
}

const CACHE_TTL: Duration = Duration::from_secs(30);

struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
}

/// Bounded-size 30 s TTL cache, per §6's recommendation. Evicts the oldest
/// entry when over capacity rather than growing unbounded.
struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    capacity: usize,
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().await;
        entries.get(key).and_then(|e| {
            if e.fetched_at.elapsed() < CACHE_TTL {
                Some(e.value.clone())
            } else {
                None
            }
        })
    }

    async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.fetched_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }
}

/// HTTP-backed [`MarketDataSource`] against the venue's public market-data
/// endpoints. Caches option details and futures price for 30 s; orderbook
/// reads are always fresh since fill/executor decisions depend on current
/// depth.
pub struct HttpMarketDataSource {
    http: Client,
    base_url: String,
    details_cache: TtlCache<Symbol, OptionDetails>,
    futures_cache: TtlCache<String, Decimal>,
}

impl HttpMarketDataSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.into(),
            details_cache: TtlCache::new(512),
            futures_cache: TtlCache::new(32),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> CoreResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        let text = resp
            .text()
            .await
            .map_err(|e| CoreError::Transport(format!("read body: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| CoreError::Transport(format!("parse market data: {e}")))
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketDataSource {
    async fn get_orderbook(&self, symbol: &Symbol) -> CoreResult<Option<Orderbook>> {
        let path = format!("/market_data/orderbook?symbol={}", symbol.as_str());
        match self.get_json::<Orderbook>(&path).await {
            Ok(book) => Ok(Some(book)),
            Err(CoreError::Transport(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_option_details(&self, symbol: &Symbol) -> CoreResult<Option<OptionDetails>> {
        if let Some(cached) = self.details_cache.get(symbol).await {
            return Ok(Some(cached));
        }
        let path = format!("/option/details?symbol={}", symbol.as_str());
        match self.get_json::<OptionDetails>(&path).await {
            Ok(details) => {
                self.details_cache
                    .insert(symbol.clone(), details.clone())
                    .await;
                Ok(Some(details))
            }
            Err(CoreError::Transport(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_instruments(&self, underlying: &str) -> CoreResult<Vec<InstrumentInfo>> {
        let path = format!("/option/instruments?underlying={underlying}");
        self.get_json(&path).await
    }

    async fn get_futures_price(&self, underlying: &str, use_cache: bool) -> CoreResult<Decimal> {
        if use_cache {
            if let Some(cached) = self.futures_cache.get(&underlying.to_string()).await {
                return Ok(cached);
            }
        }
        let path = format!("/futures/index_price?underlying={underlying}");
        #[derive(Deserialize)]
        struct IndexPrice {
            price: Decimal,
        }
        let resp: IndexPrice = self.get_json(&path).await?;
        self.futures_cache
            .insert(underlying.to_string(), resp.price)
            .await;
        Ok(resp.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orderbook_reports_top_of_book() {
        let book = Orderbook {
            bids: vec![BookLevel {
                price: Decimal::new(10050, 2),
                size: Decimal::ONE,
            }],
            asks: vec![BookLevel {
                price: Decimal::new(10060, 2),
                size: Decimal::ONE,
            }],
            mark: None,
        };
        assert_eq!(book.best_bid().unwrap().price, Decimal::new(10050, 2));
        assert_eq!(book.best_ask().unwrap().price, Decimal::new(10060, 2));
    }

    #[test]
    fn empty_orderbook_side_reports_none() {
        let book = Orderbook::default();
        assert!(book.best_bid().is_none());
        assert!(book.best_ask().is_none());
    }

    #[tokio::test]
    async fn ttl_cache_evicts_oldest_over_capacity() {
        let cache: TtlCache<String, i32> = TtlCache::new(2);
        cache.insert("a".to_string(), 1).await;
        cache.insert("b".to_string(), 2).await;
        cache.insert("c".to_string(), 3).await;
        let entries = cache.entries.lock().await;
        assert_eq!(entries.len(), 2);
        assert!(entries.contains_key("c"));
    }
}
