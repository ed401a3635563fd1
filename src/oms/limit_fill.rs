//! Limit-fill manager (§4.3): drives a set of per-leg limit orders from
//! first placement to either all-filled or exhausted retries.

use crate::error::{CoreError, CoreResult};
use crate::market_data::MarketDataSource;
use crate::oms::types::{ExecutionParams, Leg};
use crate::venue::{CreateOrderRequest, HttpMethod, VenueTransport};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Filled,
    Requoted,
    Failed,
    Pending,
}

struct LegRuntime {
    requote_rounds: u32,
}

/// Manages the lifetime of one round of limit orders for a single leg set.
/// A fresh instance is created per open/close attempt — it holds no state
/// across trade lifecycle transitions.
pub struct LimitFillManager {
    params: ExecutionParams,
    runtimes: HashMap<String, LegRuntime>,
    round_started_at: Instant,
}

impl LimitFillManager {
    pub fn new(params: ExecutionParams) -> Self {
        Self {
            params,
            runtimes: HashMap::new(),
            round_started_at: Instant::now(),
        }
    }

    async fn aggressive_price(
        &self,
        leg: &Leg,
        market_data: &dyn MarketDataSource,
    ) -> CoreResult<Decimal> {
        let book = market_data
            .get_orderbook(&leg.symbol)
            .await?
            .ok_or_else(|| CoreError::NoOrderbook(leg.symbol.to_string()))?;
        let buffer = Decimal::ONE + self.params.aggressive_buffer_pct;
        match leg.side {
            crate::types::Side::Buy => {
                let ask = book
                    .best_ask()
                    .ok_or_else(|| CoreError::EmptyBookSide {
                        symbol: leg.symbol.to_string(),
                        side: "ask",
                    })?;
                Ok((ask.price * buffer).round_dp(2))
            }
            crate::types::Side::Sell => {
                let bid = book
                    .best_bid()
                    .ok_or_else(|| CoreError::EmptyBookSide {
                        symbol: leg.symbol.to_string(),
                        side: "bid",
                    })?;
                Ok((bid.price / buffer).round_dp(2))
            }
        }
    }

    /// Place all legs at an aggressive limit price. On any failure, cancel
    /// everything placed so far and report failure — no partial state is
    /// left live for the caller to clean up.
    pub async fn place_all(
        &mut self,
        legs: &mut [Leg],
        transport: &dyn VenueTransport,
        market_data: &dyn MarketDataSource,
    ) -> CoreResult<()> {
        self.round_started_at = Instant::now();
        let mut placed: Vec<usize> = Vec::new();

        for (idx, leg) in legs.iter_mut().enumerate() {
            let price = match self.aggressive_price(leg, market_data).await {
                Ok(p) => p,
                Err(e) => {
                    self.cancel_legs(legs, &placed, transport).await;
                    return Err(e);
                }
            };
            match self.place_one(leg, price, transport).await {
                Ok(order_id) => {
                    leg.order_id = Some(order_id);
                    self.runtimes
                        .entry(leg.symbol.to_string())
                        .or_insert(LegRuntime { requote_rounds: 0 });
                    placed.push(idx);
                }
                Err(e) => {
                    self.cancel_legs(legs, &placed, transport).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn place_one(
        &self,
        leg: &Leg,
        price: Decimal,
        transport: &dyn VenueTransport,
    ) -> CoreResult<String> {
        let req = CreateOrderRequest::limit(
            leg.symbol.to_string(),
            leg.remaining_qty(),
            leg.side.trade_side_code(),
            price,
        );
        let body = serde_json::to_value(&req).map_err(CoreError::Serde)?;
        let resp = transport
            .request(HttpMethod::Post, "/open/option/order/create/v1", Some(body), None)
            .await?;
        if !resp.is_success() {
            return Err(CoreError::PlacementFailed(format!(
                "{} ({})",
                leg.symbol, resp.msg
            )));
        }
        #[derive(serde::Deserialize)]
        struct CreateData {
            #[serde(rename = "orderId")]
            order_id: String,
        }
        let data: CreateData = serde_json::from_value(resp.data).map_err(CoreError::Serde)?;
        Ok(data.order_id)
    }

    async fn cancel_legs(&self, legs: &[Leg], indices: &[usize], transport: &dyn VenueTransport) {
        for &idx in indices {
            if let Some(order_id) = &legs[idx].order_id {
                self.cancel_order(order_id, transport).await;
            }
        }
    }

    async fn cancel_order(&self, order_id: &str, transport: &dyn VenueTransport) {
        let body = serde_json::json!({ "orderId": order_id });
        if let Err(e) = transport
            .request(HttpMethod::Post, "/open/option/order/cancel/v1", Some(body), None)
            .await
        {
            tracing::warn!(order_id, error = %e, "best-effort order cancel failed");
        }
    }

    async fn refresh_fill(&self, leg: &mut Leg, transport: &dyn VenueTransport) -> CoreResult<()> {
        let Some(order_id) = leg.order_id.clone() else {
            return Ok(());
        };
        let path = format!("/open/option/order/singleQuery/v1?orderId={order_id}");
        let resp = transport.request(HttpMethod::Get, &path, None, None).await?;
        if !resp.is_success() {
            return Ok(());
        }
        let data: crate::venue::QueryOrderData =
            serde_json::from_value(resp.data).map_err(CoreError::Serde)?;
        if data.fill_qty > leg.filled_qty {
            leg.filled_qty = data.fill_qty;
            leg.avg_fill_price = data.avg_price;
        }
        if data.state == crate::venue::VenueOrderState::Canceled as i32 && !leg.is_filled() {
            tracing::info!(symbol = %leg.symbol, "leg order cancelled venue-side with an open gap remaining");
        }
        Ok(())
    }

    /// One tick of the fill-detection / requote state machine.
    pub async fn tick(
        &mut self,
        legs: &mut [Leg],
        transport: &dyn VenueTransport,
        market_data: &dyn MarketDataSource,
    ) -> CoreResult<TickOutcome> {
        for leg in legs.iter_mut() {
            if !leg.is_filled() {
                self.refresh_fill(leg, transport).await?;
            }
        }

        if legs.iter().all(Leg::is_filled) {
            return Ok(TickOutcome::Filled);
        }

        let elapsed = self.round_started_at.elapsed().as_secs();
        if elapsed < self.params.fill_timeout_secs {
            return Ok(TickOutcome::Pending);
        }

        for leg in legs.iter() {
            if leg.is_filled() {
                continue;
            }
            let rounds = self
                .runtimes
                .get(leg.symbol.as_str())
                .map(|r| r.requote_rounds)
                .unwrap_or(0);
            if rounds >= self.params.max_requote_rounds {
                return Ok(TickOutcome::Failed);
            }
        }

        self.requote(legs, transport, market_data).await?;
        Ok(TickOutcome::Requoted)
    }

    async fn requote(
        &mut self,
        legs: &mut [Leg],
        transport: &dyn VenueTransport,
        market_data: &dyn MarketDataSource,
    ) -> CoreResult<()> {
        self.round_started_at = Instant::now();
        for leg in legs.iter_mut() {
            if leg.is_filled() {
                continue;
            }
            if let Some(order_id) = leg.order_id.clone() {
                self.cancel_order(&order_id, transport).await;
            }
            let price = self.aggressive_price(leg, market_data).await?;
            let order_id = self.place_one(leg, price, transport).await?;
            leg.order_id = Some(order_id);
            let runtime = self
                .runtimes
                .entry(leg.symbol.to_string())
                .or_insert(LegRuntime { requote_rounds: 0 });
            runtime.requote_rounds += 1;
        }
        Ok(())
    }

    /// Cancel every currently unfilled order, best-effort. Called on FAILED
    /// transitions or manual cancel.
    pub async fn cancel_all(&self, legs: &[Leg], transport: &dyn VenueTransport) {
        for leg in legs {
            if !leg.is_filled() {
                if let Some(order_id) = &leg.order_id {
                    self.cancel_order(order_id, transport).await;
                }
            }
        }
    }
}
