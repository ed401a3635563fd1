//! Block-quote (RFQ) executor (§4.5): submits a multi-leg structure for
//! block quotes, polls incoming quotes against the orderbook baseline, and
//! accepts the best one matching the taker's intended direction.
//!
//! The sign convention on `Quote::total_cost` — positive means the taker
//! pays, negative means the taker receives credit — comes straight from
//! the original Python RFQ module's `rfq.py`; §4.5's baseline/improvement
//! formulas are built to be consistent with it.

use crate::error::{CoreError, CoreResult};
use crate::market_data::MarketDataSource;
use crate::oms::types::{Leg, Quote, QuoteLeg, QuoteState, RfqAction};
use crate::types::Side;
use crate::venue::{CreateRfqRequest, HttpMethod, RfqLegRequest, VenueTransport};
use rust_decimal::Decimal;
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy)]
pub struct RfqExecutorConfig {
    pub poll_interval_secs: u64,
    pub total_wait_secs: u64,
    pub min_improvement_pct: Decimal,
}

impl Default for RfqExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            total_wait_secs: 60,
            min_improvement_pct: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RfqResult {
    pub quote: Quote,
    pub total_cost: Decimal,
}

pub struct BlockQuoteExecutor {
    config: RfqExecutorConfig,
}

impl BlockQuoteExecutor {
    pub fn new(config: RfqExecutorConfig) -> Self {
        Self { config }
    }

    /// Whether the taker is effectively buying this leg: `action == buy XOR
    /// leg.side == sell`.
    fn effectively_buying(action: RfqAction, leg_side: Side) -> bool {
        matches!(action, RfqAction::Buy) ^ matches!(leg_side, Side::Sell)
    }

    async fn baseline_cost(&self, legs: &[Leg], action: RfqAction, market_data: &dyn MarketDataSource) -> Option<Decimal> {
        let mut total = Decimal::ZERO;
        for leg in legs {
            let book = market_data.get_orderbook(&leg.symbol).await.ok().flatten()?;
            if Self::effectively_buying(action, leg.side) {
                let ask = book.best_ask()?;
                total += ask.price * leg.qty;
            } else {
                let bid = book.best_bid()?;
                total -= bid.price * leg.qty;
            }
        }
        Some(total)
    }

    fn improvement_pct(baseline: Decimal, quote_cost: Decimal) -> Decimal {
        if baseline.is_zero() {
            return Decimal::ZERO;
        }
        (baseline - quote_cost) / baseline.abs() * Decimal::ONE_HUNDRED
    }

    async fn submit_rfq(&self, legs: &[Leg], transport: &dyn VenueTransport) -> CoreResult<(String, i64)> {
        let req = CreateRfqRequest {
            legs: legs
                .iter()
                .map(|l| RfqLegRequest {
                    instrument_name: l.symbol.to_string(),
                    side: l.side.to_string().to_uppercase(),
                    qty: l.qty,
                })
                .collect(),
        };
        let body = serde_json::to_value(&req).map_err(CoreError::Serde)?;
        let resp = transport
            .request(HttpMethod::Post, "/open/option/rfq/create/v1", Some(body), None)
            .await?;
        if !resp.is_success() {
            return Err(CoreError::RfqRejected(resp.msg));
        }
        let data: crate::venue::CreateRfqData = serde_json::from_value(resp.data).map_err(CoreError::Serde)?;
        Ok((data.request_id, data.expiry_time))
    }

    async fn poll_quotes(&self, request_id: &str, transport: &dyn VenueTransport) -> CoreResult<Vec<crate::venue::VenueQuote>> {
        let path = format!("/open/option/rfq/quotes/v1?requestId={request_id}");
        let resp = transport.request(HttpMethod::Get, &path, None, None).await?;
        if !resp.is_success() {
            return Ok(Vec::new());
        }
        serde_json::from_value(resp.data).map_err(CoreError::Serde)
    }

    async fn accept_quote(&self, request_id: &str, quote_id: &str, transport: &dyn VenueTransport) -> CoreResult<()> {
        let body = serde_json::json!({ "requestId": request_id, "quoteId": quote_id });
        let resp = transport
            .request(HttpMethod::Post, "/open/option/rfq/accept/v1", None, Some(body))
            .await?;
        if !resp.is_success() {
            return Err(CoreError::RfqRejected(resp.msg));
        }
        Ok(())
    }

    async fn cancel_rfq(&self, request_id: &str, transport: &dyn VenueTransport) {
        let body = serde_json::json!({ "requestId": request_id });
        if let Err(e) = transport
            .request(HttpMethod::Post, "/open/option/rfq/cancel/v1", None, Some(body))
            .await
        {
            tracing::warn!(request_id, error = %e, "rfq cancel failed");
        }
    }

    pub async fn run(
        &self,
        legs: &[Leg],
        action: RfqAction,
        transport: &dyn VenueTransport,
        market_data: &dyn MarketDataSource,
    ) -> CoreResult<RfqResult> {
        let baseline = self.baseline_cost(legs, action, market_data).await;
        let (request_id, venue_expiry_ms) = self.submit_rfq(legs, transport).await?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let spec_deadline = Instant::now() + Duration::from_secs(self.config.total_wait_secs);
        let venue_deadline_ms = venue_expiry_ms.max(now_ms);
        let venue_wait = Duration::from_millis((venue_deadline_ms - now_ms).max(0) as u64);
        let deadline = std::cmp::min(spec_deadline, Instant::now() + venue_wait);

        while Instant::now() < deadline {
            let raw_quotes = self.poll_quotes(&request_id, transport).await?;
            let now_ms = chrono::Utc::now().timestamp_millis();

            let mut candidates: Vec<(Quote, Decimal)> = raw_quotes
                .into_iter()
                .filter_map(|q| parse_quote(q).ok())
                .filter(|q| q.state == QuoteState::Open)
                .filter(|q| q.expiry_time_ms >= now_ms + 1000)
                .filter(|q| quote_matches_direction(q, action))
                .map(|q| {
                    let cost = q.total_cost();
                    (q, cost)
                })
                .collect();

            candidates.sort_by(|a, b| a.1.cmp(&b.1));

            for (quote, cost) in &candidates {
                let improvement = baseline.map(|b| Self::improvement_pct(b, *cost));
                tracing::info!(quote_id = %quote.quote_id, cost = %cost, improvement = ?improvement, "surviving rfq quote");
            }

            if let Some((best_quote, best_cost)) = candidates.first() {
                let gate_passes = match baseline {
                    Some(b) => Self::improvement_pct(b, *best_cost) >= self.config.min_improvement_pct,
                    None => true,
                };

                if gate_passes {
                    for (quote, cost) in &candidates {
                        if self.accept_quote(&request_id, &quote.quote_id, transport).await.is_ok() {
                            return Ok(RfqResult {
                                quote: quote.clone(),
                                total_cost: *cost,
                            });
                        }
                        tracing::warn!(quote_id = %quote.quote_id, "rfq quote acceptance failed, trying next best");
                    }
                }
                let _ = best_quote;
            }

            sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
        }

        self.cancel_rfq(&request_id, transport).await;
        Err(CoreError::RfqTimeout)
    }
}

fn quote_matches_direction(quote: &Quote, action: RfqAction) -> bool {
    quote.legs.iter().all(|l| match action {
        RfqAction::Buy => l.side == Side::Sell,
        RfqAction::Sell => l.side == Side::Buy,
    })
}

fn parse_quote(wire: crate::venue::VenueQuote) -> CoreResult<Quote> {
    let state = match wire.state.as_str() {
        "OPEN" => QuoteState::Open,
        "CANCELLED" => QuoteState::Cancelled,
        "FILLED" => QuoteState::Filled,
        other => return Err(CoreError::RfqRejected(format!("unknown quote state {other}"))),
    };
    let legs = wire
        .legs
        .into_iter()
        .map(|l| {
            let side = match l.side.as_str() {
                "BUY" => Side::Buy,
                "SELL" => Side::Sell,
                other => return Err(CoreError::RfqRejected(format!("unknown quote leg side {other}"))),
            };
            Ok(QuoteLeg { side, qty: l.qty, price: l.price })
        })
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(Quote {
        quote_id: wire.quote_id,
        request_id: wire.request_id,
        state,
        legs,
        created_at: chrono::DateTime::from_timestamp_millis(wire.create_time).unwrap_or_else(chrono::Utc::now),
        expiry_time_ms: wire.expiry_time,
    })
}
