//! Smart multi-leg orderbook executor (§4.4): executes a multi-leg
//! structure as a sequence of proportional chunks, quoting all legs
//! simultaneously with continuous repricing, and falling back to
//! aggressive limit orders per chunk when the quoting window lapses.

use crate::error::{CoreError, CoreResult};
use crate::market_data::{MarketDataSource, Orderbook};
use crate::oms::types::{Leg, QuotingStrategy, SmartExecConfig};
use crate::types::{Side, Symbol};
use crate::venue::{CreateOrderRequest, HttpMethod, VenueTransport};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct SmartMultiLegExecutor {
    config: SmartExecConfig,
}

impl SmartMultiLegExecutor {
    pub fn new(config: SmartExecConfig) -> Self {
        Self {
            config: config.validate(),
        }
    }

    /// Drive `legs` to completion chunk by chunk. Always returns `Ok` once
    /// every chunk has been attempted — the caller inspects each leg's
    /// `filled_qty` to decide whether to continue or unwind, per §4.4's
    /// failure-tolerance note.
    pub async fn run(
        &self,
        legs: &mut [Leg],
        transport: &dyn VenueTransport,
        market_data: &dyn MarketDataSource,
    ) -> CoreResult<()> {
        let chunk_count = self.config.chunk_count.max(1);

        for chunk_idx in 0..chunk_count {
            if legs.iter().all(|l| l.remaining_qty() < self.config.min_order_size.max(Decimal::new(1, 8))) {
                break;
            }

            let remaining_chunks = Decimal::from(chunk_count - chunk_idx);
            let chunk_start_positions = fetch_positions(transport).await;

            let is_last_chunk = chunk_idx + 1 == chunk_count;
            let chunk_targets: HashMap<String, Decimal> = legs
                .iter()
                .map(|l| {
                    let remaining = l.remaining_qty();
                    let target = if is_last_chunk {
                        remaining
                    } else {
                        let per_chunk = remaining / remaining_chunks;
                        if per_chunk < self.config.min_order_size && !per_chunk.is_zero() {
                            self.config.min_order_size.min(remaining)
                        } else {
                            per_chunk
                        }
                    };
                    (l.symbol.to_string(), target)
                })
                .collect();

            self.run_chunk_phase_a(legs, &chunk_start_positions, &chunk_targets, transport, market_data)
                .await?;

            let current = fetch_positions(transport).await;
            if !self.chunk_complete(legs, &chunk_start_positions, &current, &chunk_targets) {
                self.run_chunk_phase_b(legs, &chunk_start_positions, &chunk_targets, transport, market_data)
                    .await;
            }

            let current = fetch_positions(transport).await;
            if !self.chunk_complete(legs, &chunk_start_positions, &current, &chunk_targets) {
                tracing::warn!(chunk = chunk_idx, "chunk completed with a partial fill, continuing");
            }
        }

        Ok(())
    }

    /// Chunk completion is measured by position delta, not per-order fill
    /// status (§4.4): a multi-leg smart chunk can spread partial fills
    /// across several requotes, and summing individual order statuses can
    /// undercount what the position actually moved by.
    fn chunk_complete(
        &self,
        legs: &[Leg],
        start: &HashMap<String, Decimal>,
        current: &HashMap<String, Decimal>,
        targets: &HashMap<String, Decimal>,
    ) -> bool {
        legs.iter().all(|l| {
            let delta = (position_qty_for(current, &l.symbol) - position_qty_for(start, &l.symbol)).abs();
            let target = targets[l.symbol.as_str()];
            target.is_zero() || delta >= target
        })
    }

    async fn run_chunk_phase_a(
        &self,
        legs: &mut [Leg],
        start: &HashMap<String, Decimal>,
        targets: &HashMap<String, Decimal>,
        transport: &dyn VenueTransport,
        market_data: &dyn MarketDataSource,
    ) -> CoreResult<()> {
        let deadline = Instant::now() + Duration::from_secs(self.config.time_per_chunk_secs);
        let mut last_quote: HashMap<String, Decimal> = HashMap::new();
        let mut last_reprice = Instant::now() - Duration::from_secs(self.config.reprice_interval_secs);

        while Instant::now() < deadline {
            let needs_reprice = last_reprice.elapsed().as_secs() >= self.config.reprice_interval_secs;

            if needs_reprice {
                let current = fetch_positions(transport).await;
                self.cancel_unfilled(legs, start, &current, targets, transport).await;
                for leg in legs.iter_mut() {
                    let delta = (position_qty_for(&current, &leg.symbol) - position_qty_for(start, &leg.symbol)).abs();
                    let target = targets[leg.symbol.as_str()];
                    if delta >= target || target.is_zero() {
                        continue;
                    }
                    let price = match self.quote_price(leg, market_data).await {
                        Some(p) => p,
                        None => continue,
                    };
                    let prior = last_quote.get(leg.symbol.as_str()).copied();
                    let moved = prior
                        .map(|p| (p - price).abs() >= self.config.min_price_change)
                        .unwrap_or(true);
                    if !moved {
                        continue;
                    }
                    let chunk_remaining = target - delta;
                    match self.place_limit(leg, chunk_remaining, price, transport).await {
                        Ok(order_id) => {
                            leg.order_id = Some(order_id);
                            last_quote.insert(leg.symbol.to_string(), price);
                        }
                        Err(e) => tracing::warn!(symbol = %leg.symbol, error = %e, "chunk quote placement failed"),
                    }
                }
                last_reprice = Instant::now();
            }

            for leg in legs.iter_mut() {
                if let Some(order_id) = leg.order_id.clone() {
                    if let Err(e) = refresh_fill(leg, &order_id, transport).await {
                        tracing::warn!(symbol = %leg.symbol, error = %e, "chunk fill poll failed");
                    }
                }
            }

            let current = fetch_positions(transport).await;
            if self.chunk_complete(legs, start, &current, targets) {
                self.cancel_unfilled(legs, start, &current, targets, transport).await;
                return Ok(());
            }

            sleep(POLL_INTERVAL).await;
        }

        Ok(())
    }

    async fn run_chunk_phase_b(
        &self,
        legs: &mut [Leg],
        start: &HashMap<String, Decimal>,
        targets: &HashMap<String, Decimal>,
        transport: &dyn VenueTransport,
        market_data: &dyn MarketDataSource,
    ) {
        let current = fetch_positions(transport).await;
        self.cancel_unfilled(legs, start, &current, targets, transport).await;

        for _attempt in 0..self.config.aggressive_fallback_attempts {
            let current = fetch_positions(transport).await;
            if self.chunk_complete(legs, start, &current, targets) {
                break;
            }

            for leg in legs.iter_mut() {
                let delta = (position_qty_for(&current, &leg.symbol) - position_qty_for(start, &leg.symbol)).abs();
                let target = targets[leg.symbol.as_str()];
                let remaining = target - delta;
                if remaining < self.config.min_order_size || remaining.is_zero() {
                    continue;
                }
                let book = match market_data.get_orderbook(&leg.symbol).await {
                    Ok(Some(b)) => b,
                    _ => continue,
                };
                let price = match leg.side {
                    Side::Buy => book.best_ask().map(|a| a.price),
                    Side::Sell => book.best_bid().map(|b| b.price),
                };
                let Some(price) = price else { continue };
                match self.place_limit(leg, remaining, price.max(min_positive_price()), transport).await {
                    Ok(order_id) => leg.order_id = Some(order_id),
                    Err(e) => tracing::warn!(symbol = %leg.symbol, error = %e, "aggressive fallback placement failed"),
                }
            }

            let wait_deadline = Instant::now() + Duration::from_secs(self.config.aggressive_wait_secs);
            while Instant::now() < wait_deadline {
                for leg in legs.iter_mut() {
                    if let Some(order_id) = leg.order_id.clone() {
                        let _ = refresh_fill(leg, &order_id, transport).await;
                    }
                }
                let current = fetch_positions(transport).await;
                if self.chunk_complete(legs, start, &current, targets) {
                    break;
                }
                sleep(POLL_INTERVAL).await;
            }

            let current = fetch_positions(transport).await;
            self.cancel_unfilled(legs, start, &current, targets, transport).await;
            sleep(Duration::from_secs(self.config.pause_between_attempts_secs)).await;
        }
    }

    async fn cancel_unfilled(
        &self,
        legs: &[Leg],
        start: &HashMap<String, Decimal>,
        current: &HashMap<String, Decimal>,
        targets: &HashMap<String, Decimal>,
        transport: &dyn VenueTransport,
    ) {
        for leg in legs {
            let delta = (position_qty_for(current, &leg.symbol) - position_qty_for(start, &leg.symbol)).abs();
            let target = targets[leg.symbol.as_str()];
            if delta >= target {
                continue;
            }
            if let Some(order_id) = &leg.order_id {
                let body = serde_json::json!({ "orderId": order_id });
                if let Err(e) = transport
                    .request(HttpMethod::Post, "/open/option/order/cancel/v1", Some(body), None)
                    .await
                {
                    tracing::warn!(order_id, error = %e, "best-effort chunk order cancel failed");
                }
            }
        }
    }

    async fn place_limit(
        &self,
        leg: &Leg,
        qty: Decimal,
        price: Decimal,
        transport: &dyn VenueTransport,
    ) -> CoreResult<String> {
        let req = CreateOrderRequest::limit(leg.symbol.to_string(), qty, leg.side.trade_side_code(), price);
        let body = serde_json::to_value(&req).map_err(CoreError::Serde)?;
        let resp = transport
            .request(HttpMethod::Post, "/open/option/order/create/v1", Some(body), None)
            .await?;
        if !resp.is_success() {
            return Err(CoreError::PlacementFailed(format!("{} ({})", leg.symbol, resp.msg)));
        }
        #[derive(serde::Deserialize)]
        struct CreateData {
            #[serde(rename = "orderId")]
            order_id: String,
        }
        let data: CreateData = serde_json::from_value(resp.data).map_err(CoreError::Serde)?;
        Ok(data.order_id)
    }

    async fn quote_price(&self, leg: &Leg, market_data: &dyn MarketDataSource) -> Option<Decimal> {
        let book = market_data.get_orderbook(&leg.symbol).await.ok().flatten()?;
        quote_price_for_strategy(self.config.quoting_strategy, self.config.spread_offset_pct, leg.side, &book)
    }
}

fn min_positive_price() -> Decimal {
    Decimal::new(1, 3)
}

fn quote_price_for_strategy(
    strategy: QuotingStrategy,
    offset: Decimal,
    side: Side,
    book: &Orderbook,
) -> Option<Decimal> {
    let bid = book.best_bid().map(|b| b.price);
    let ask = book.best_ask().map(|a| a.price);

    let price = match strategy {
        QuotingStrategy::TopOfBook => match side {
            Side::Buy => bid,
            Side::Sell => ask,
        },
        QuotingStrategy::TopOfBookWithOffset => match (side, bid, ask) {
            (Side::Buy, Some(b), _) => Some(b * (Decimal::ONE + offset)),
            (Side::Sell, _, Some(a)) => Some(a * (Decimal::ONE - offset)),
            _ => None,
        },
        QuotingStrategy::Mid | QuotingStrategy::Mark => match (bid, ask) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        },
    };

    price.map(|p| p.max(min_positive_price()))
}

#[derive(serde::Deserialize)]
struct WirePositionQty {
    symbol: String,
    qty: Decimal,
    side: Side,
}

/// Snapshots `/positions` into a per-symbol signed quantity (long positive,
/// short negative) so chunk progress can be measured by how far each
/// symbol's position has actually moved, rather than by summing individual
/// order fill statuses. A fetch failure yields an empty snapshot, which
/// `position_qty_for` reads back as zero — the executor then treats that
/// leg as not yet having moved and keeps working it.
async fn fetch_positions(transport: &dyn VenueTransport) -> HashMap<String, Decimal> {
    let resp = match transport.request(HttpMethod::Get, "/positions", None, None).await {
        Ok(r) if r.is_success() => r,
        _ => return HashMap::new(),
    };
    let wire: Vec<WirePositionQty> = match serde_json::from_value(resp.data) {
        Ok(w) => w,
        Err(_) => return HashMap::new(),
    };
    wire.into_iter()
        .map(|p| {
            let signed = match p.side {
                Side::Buy => p.qty,
                Side::Sell => -p.qty,
            };
            (p.symbol, signed)
        })
        .collect()
}

fn position_qty_for(positions: &HashMap<String, Decimal>, symbol: &Symbol) -> Decimal {
    positions.get(symbol.as_str()).copied().unwrap_or(Decimal::ZERO)
}

async fn refresh_fill(leg: &mut Leg, order_id: &str, transport: &dyn VenueTransport) -> CoreResult<()> {
    let path = format!("/open/option/order/singleQuery/v1?orderId={order_id}");
    let resp = transport.request(HttpMethod::Get, &path, None, None).await?;
    if !resp.is_success() {
        return Ok(());
    }
    let data: crate::venue::QueryOrderData = serde_json::from_value(resp.data).map_err(CoreError::Serde)?;
    if data.fill_qty > leg.filled_qty {
        leg.filled_qty = data.fill_qty;
        leg.avg_fill_price = data.avg_price;
    }
    Ok(())
}
