//! Execution router (§4.2, §4.7): chooses a fill strategy for a trade's
//! first open attempt based on leg count and notional size.
//!
//! Lightweight by design — embedded in the lifecycle manager rather than
//! run as its own task, mirroring how `src/coindcx/client.rs` treats rate
//! limiting and retries as properties of a call rather than a separate
//! component.

use crate::market_data::MarketDataSource;
use crate::oms::types::{Leg, TradeMode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouterConfig {
    pub rfq_threshold: Decimal,
    pub smart_threshold: Decimal,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            rfq_threshold: Decimal::new(50_000, 0),
            smart_threshold: Decimal::new(10_000, 0),
        }
    }
}

/// Routes a trade's legs to a fill strategy. Notional is recomputed from
/// fresh orderbook data on every call — never cached — so a trade that
/// retries an open attempt always routes off current prices.
pub struct ExecutionRouter {
    config: RouterConfig,
}

impl ExecutionRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// `Σ mark_price × qty` over `legs`. A leg whose mark cannot be fetched
    /// contributes zero and is logged, per §4.2 — it is not treated as a
    /// routing failure.
    pub async fn compute_notional(&self, legs: &[Leg], market_data: &dyn MarketDataSource) -> Decimal {
        let mut total = Decimal::ZERO;
        for leg in legs {
            let mark = match market_data.get_orderbook(&leg.symbol).await {
                Ok(Some(book)) => book.mark,
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(symbol = %leg.symbol, error = %e, "orderbook fetch failed while computing notional");
                    None
                }
            };
            match mark {
                Some(mark) => total += mark * leg.qty,
                None => {
                    tracing::warn!(symbol = %leg.symbol, "no mark price available, contributing zero notional");
                }
            }
        }
        total
    }

    pub async fn route(&self, legs: &[Leg], market_data: &dyn MarketDataSource) -> TradeMode {
        if legs.len() == 1 {
            return TradeMode::Limit;
        }
        let notional = self.compute_notional(legs, market_data).await;
        if notional >= self.config.rfq_threshold {
            TradeMode::Rfq
        } else if notional >= self.config.smart_threshold {
            TradeMode::Smart
        } else {
            TradeMode::Limit
        }
    }
}
