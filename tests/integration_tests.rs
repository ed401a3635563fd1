//! End-to-end coverage of the lifecycle manager against fake venue and
//! market-data collaborators: order placement, fill detection, requote
//! exhaustion, partial-fill unwinds, and the RFQ improvement gate.

use async_trait::async_trait;
use coincall_options_trader::account::AccountSnapshot;
use coincall_options_trader::error::{CoreError, CoreResult};
use coincall_options_trader::market_data::{BookLevel, InstrumentInfo, MarketDataSource, OptionDetails, Orderbook};
use coincall_options_trader::oms::{
    BlockQuoteExecutor, ExecutionRouter, ExitPredicate, Leg, RfqAction, RfqExecutorConfig, RouterConfig,
    SmartExecConfig, SmartMultiLegExecutor, Trade, TradeMode, TradeState,
};
use coincall_options_trader::persistence::TradeStatePersistence;
use coincall_options_trader::types::{Side, Symbol};
use coincall_options_trader::venue::{HttpMethod, TransportResponse, VenueTransport};
use coincall_options_trader::LifecycleManager;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

struct OrderRecord {
    symbol: String,
    trade_side: i32,
    filled_qty: Decimal,
    avg_price: Decimal,
    cancelled: bool,
}

/// Fake venue transport: order creation fills instantly up to each symbol's
/// configured cap (unset means fully), and RFQ polling serves a fixed list
/// of pre-seeded quotes.
struct FakeTransport {
    next_id: AtomicU64,
    orders: StdMutex<HashMap<String, OrderRecord>>,
    fill_cap: HashMap<String, Decimal>,
    rfq_quotes: Vec<Value>,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            orders: StdMutex::new(HashMap::new()),
            fill_cap: HashMap::new(),
            rfq_quotes: Vec::new(),
        }
    }

    fn with_fill_cap(mut self, symbol: &str, cap: Decimal) -> Self {
        self.fill_cap.insert(symbol.to_string(), cap);
        self
    }

    fn with_rfq_quotes(mut self, quotes: Vec<Value>) -> Self {
        self.rfq_quotes = quotes;
        self
    }
}

fn decimal_field(v: &Value, key: &str) -> Decimal {
    match v.get(key) {
        Some(Value::String(s)) => Decimal::from_str(s).unwrap_or_default(),
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string()).unwrap_or_default(),
        _ => Decimal::ZERO,
    }
}

#[async_trait]
impl VenueTransport for FakeTransport {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        json_body: Option<Value>,
        form_body: Option<Value>,
    ) -> CoreResult<TransportResponse> {
        let body = json_body.or(form_body).unwrap_or(Value::Null);
        let path_only = path.split('?').next().unwrap_or(path);

        match (method, path_only) {
            (HttpMethod::Post, "/open/option/order/create/v1") => {
                let symbol = body.get("symbol").and_then(Value::as_str).unwrap_or_default().to_string();
                let trade_side = body.get("tradeSide").and_then(Value::as_i64).unwrap_or(1) as i32;
                let qty = decimal_field(&body, "qty");
                let price = decimal_field(&body, "price");
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let order_id = format!("order-{id}");
                let cap = self.fill_cap.get(&symbol).copied().unwrap_or(qty);
                let filled = qty.min(cap);
                self.orders.lock().unwrap().insert(
                    order_id.clone(),
                    OrderRecord { symbol, trade_side, filled_qty: filled, avg_price: price, cancelled: false },
                );
                Ok(TransportResponse { code: 0, msg: String::new(), data: json!({ "orderId": order_id }) })
            }
            (HttpMethod::Get, "/positions") => {
                let mut positions: HashMap<String, Decimal> = HashMap::new();
                for rec in self.orders.lock().unwrap().values() {
                    if rec.cancelled || rec.filled_qty.is_zero() {
                        continue;
                    }
                    let signed = if rec.trade_side == 1 { rec.filled_qty } else { -rec.filled_qty };
                    *positions.entry(rec.symbol.clone()).or_insert(Decimal::ZERO) += signed;
                }
                let wire: Vec<Value> = positions
                    .into_iter()
                    .filter(|(_, qty)| !qty.is_zero())
                    .map(|(symbol, qty)| {
                        let (side, qty) = if qty.is_sign_positive() { ("buy", qty) } else { ("sell", -qty) };
                        json!({ "symbol": symbol, "qty": qty, "side": side })
                    })
                    .collect();
                Ok(TransportResponse { code: 0, msg: String::new(), data: Value::Array(wire) })
            }
            (HttpMethod::Get, p) if p.starts_with("/open/option/order/singleQuery/v1") => {
                let order_id = path.split("orderId=").nth(1).unwrap_or("").to_string();
                let orders = self.orders.lock().unwrap();
                let (fill_qty, avg_price, state) = match orders.get(&order_id) {
                    Some(r) if r.cancelled => (r.filled_qty, r.avg_price, 3),
                    Some(r) if r.filled_qty.is_zero() => (r.filled_qty, r.avg_price, 0),
                    Some(r) => (r.filled_qty, r.avg_price, 1),
                    None => (Decimal::ZERO, Decimal::ZERO, 0),
                };
                Ok(TransportResponse {
                    code: 0,
                    msg: String::new(),
                    data: json!({
                        "orderId": order_id,
                        "symbol": "",
                        "qty": fill_qty,
                        "fillQty": fill_qty,
                        "remainQty": Decimal::ZERO,
                        "avgPrice": avg_price,
                        "state": state,
                        "tradeSide": 1,
                    }),
                })
            }
            (HttpMethod::Post, "/open/option/order/cancel/v1") => {
                if let Some(order_id) = body.get("orderId").and_then(Value::as_str) {
                    if let Some(rec) = self.orders.lock().unwrap().get_mut(order_id) {
                        rec.cancelled = true;
                    }
                }
                Ok(TransportResponse { code: 0, msg: String::new(), data: Value::Null })
            }
            (HttpMethod::Post, "/open/option/rfq/create/v1") => Ok(TransportResponse {
                code: 0,
                msg: String::new(),
                data: json!({
                    "requestId": "req-1",
                    "expiryTime": chrono::Utc::now().timestamp_millis() + 60_000,
                    "state": "OPEN",
                }),
            }),
            (HttpMethod::Get, p) if p.starts_with("/open/option/rfq/quotes/v1") => {
                Ok(TransportResponse { code: 0, msg: String::new(), data: Value::Array(self.rfq_quotes.clone()) })
            }
            (HttpMethod::Post, "/open/option/rfq/accept/v1") => {
                Ok(TransportResponse { code: 0, msg: String::new(), data: Value::Null })
            }
            (HttpMethod::Post, "/open/option/rfq/cancel/v1") => {
                Ok(TransportResponse { code: 0, msg: String::new(), data: Value::Null })
            }
            _ => Err(CoreError::Transport(format!("unhandled fake transport call: {path_only}"))),
        }
    }
}

/// Fake market-data source backed by a fixed per-symbol orderbook.
struct FakeMarketData {
    books: HashMap<String, Orderbook>,
}

impl FakeMarketData {
    fn new() -> Self {
        Self { books: HashMap::new() }
    }

    fn with_book(mut self, symbol: &str, bid: Decimal, ask: Decimal) -> Self {
        self.books.insert(
            symbol.to_string(),
            Orderbook {
                bids: vec![BookLevel { price: bid, size: Decimal::ONE }],
                asks: vec![BookLevel { price: ask, size: Decimal::ONE }],
                mark: Some((bid + ask) / Decimal::TWO),
            },
        );
        self
    }
}

#[async_trait]
impl MarketDataSource for FakeMarketData {
    async fn get_orderbook(&self, symbol: &Symbol) -> CoreResult<Option<Orderbook>> {
        Ok(self.books.get(symbol.as_str()).cloned())
    }

    async fn get_option_details(&self, _symbol: &Symbol) -> CoreResult<Option<OptionDetails>> {
        Ok(None)
    }

    async fn get_instruments(&self, _underlying: &str) -> CoreResult<Vec<InstrumentInfo>> {
        Ok(vec![])
    }

    async fn get_futures_price(&self, _underlying: &str, _use_cache: bool) -> CoreResult<Decimal> {
        Ok(Decimal::ZERO)
    }
}

fn empty_account() -> AccountSnapshot {
    AccountSnapshot {
        taken_at: chrono::Utc::now(),
        equity: Decimal::ZERO,
        available_margin: Decimal::ZERO,
        initial_margin: Decimal::ZERO,
        maintenance_margin: Decimal::ZERO,
        unrealized_pnl: Decimal::ZERO,
        positions: vec![],
    }
}

fn make_lifecycle(transport: FakeTransport, market_data: FakeMarketData, test_name: &str) -> LifecycleManager {
    let transport: Arc<dyn VenueTransport> = Arc::new(transport);
    let market_data: Arc<dyn MarketDataSource> = Arc::new(market_data);
    let router = ExecutionRouter::new(RouterConfig::default());
    let rfq_executor = BlockQuoteExecutor::new(RfqExecutorConfig::default());
    let state_path =
        std::env::temp_dir().join(format!("lifecycle-test-{test_name}-{:?}.json", std::thread::current().id()));
    let persistence = TradeStatePersistence::new(state_path);
    LifecycleManager::new(transport, market_data, router, rfq_executor, persistence)
}

#[tokio::test]
async fn single_leg_limit_trade_opens_and_closes_on_exit_predicate() {
    let symbol = "BTC-28FEB26-90000-C";
    let transport = FakeTransport::new();
    let market_data = FakeMarketData::new().with_book(symbol, dec!(490), dec!(510));
    let lifecycle = make_lifecycle(transport, market_data, "single-leg");

    let mut trade = Trade::new("strat-1", vec![Leg::new(Symbol::new(symbol), dec!(1), Side::Buy)], RfqAction::Buy);
    trade.mode = TradeMode::Limit;
    trade.execution_params.fill_timeout_secs = 0;
    let exit_always: ExitPredicate = Arc::new(|_: &AccountSnapshot, _: &Trade| true);
    let id = lifecycle.open(trade, vec![exit_always]).await;
    let account = empty_account();

    lifecycle.tick_all(&account).await;
    assert_eq!(lifecycle.get(&id).await.unwrap().state, TradeState::Opening);

    lifecycle.tick_all(&account).await;
    assert_eq!(lifecycle.get(&id).await.unwrap().state, TradeState::Open);

    lifecycle.tick_all(&account).await;
    assert_eq!(lifecycle.get(&id).await.unwrap().state, TradeState::PendingClose);

    lifecycle.tick_all(&account).await;
    assert_eq!(lifecycle.get(&id).await.unwrap().state, TradeState::Closing);

    lifecycle.tick_all(&account).await;
    let closed = lifecycle.get(&id).await.unwrap();
    assert_eq!(closed.state, TradeState::Closed);
    assert!(closed.closed_at.is_some());
}

#[tokio::test]
async fn limit_trade_fails_when_requotes_exhausted_with_no_fill() {
    let symbol = "BTC-28FEB26-90000-C";
    let transport = FakeTransport::new().with_fill_cap(symbol, Decimal::ZERO);
    let market_data = FakeMarketData::new().with_book(symbol, dec!(490), dec!(510));
    let lifecycle = make_lifecycle(transport, market_data, "requote-exhausted");

    let mut trade = Trade::new("strat-1", vec![Leg::new(Symbol::new(symbol), dec!(1), Side::Buy)], RfqAction::Buy);
    trade.mode = TradeMode::Limit;
    trade.execution_params.fill_timeout_secs = 0;
    trade.execution_params.max_requote_rounds = 0;
    let id = lifecycle.open(trade, vec![]).await;
    let account = empty_account();

    lifecycle.tick_all(&account).await;
    lifecycle.tick_all(&account).await;

    let failed = lifecycle.get(&id).await.unwrap();
    assert_eq!(failed.state, TradeState::Failed);
    assert!(failed.error.is_some());
}

#[tokio::test]
async fn multi_leg_limit_open_partially_fills_then_unwinds_unfilled_leg() {
    let filled_symbol = "BTC-28FEB26-90000-C";
    let stuck_symbol = "BTC-28FEB26-95000-C";
    let transport = FakeTransport::new().with_fill_cap(stuck_symbol, Decimal::ZERO);
    let market_data = FakeMarketData::new()
        .with_book(filled_symbol, dec!(490), dec!(510))
        .with_book(stuck_symbol, dec!(290), dec!(310));
    let lifecycle = make_lifecycle(transport, market_data, "partial-fill-unwind");

    let legs = vec![
        Leg::new(Symbol::new(filled_symbol), dec!(1), Side::Buy),
        Leg::new(Symbol::new(stuck_symbol), dec!(1), Side::Sell),
    ];
    let mut trade = Trade::new("strat-1", legs, RfqAction::Buy);
    trade.mode = TradeMode::Limit;
    trade.execution_params.fill_timeout_secs = 0;
    trade.execution_params.max_requote_rounds = 0;
    let id = lifecycle.open(trade, vec![]).await;
    let account = empty_account();

    lifecycle.tick_all(&account).await;
    lifecycle.tick_all(&account).await;

    let unwound = lifecycle.get(&id).await.unwrap();
    assert_eq!(unwound.state, TradeState::PendingClose);
    assert_eq!(unwound.open_legs.len(), 1);
    assert_eq!(unwound.open_legs[0].symbol.as_str(), filled_symbol);
}

#[tokio::test]
async fn force_close_during_closing_retries_via_pending_close() {
    let symbol = "BTC-28FEB26-90000-C";
    let transport = FakeTransport::new();
    let market_data = FakeMarketData::new().with_book(symbol, dec!(490), dec!(510));
    let lifecycle = make_lifecycle(transport, market_data, "force-close-closing");

    let mut trade = Trade::new("strat-1", vec![Leg::new(Symbol::new(symbol), dec!(1), Side::Buy)], RfqAction::Buy);
    trade.mode = TradeMode::Limit;
    trade.execution_params.fill_timeout_secs = 0;
    let id = lifecycle.open(trade, vec![]).await;
    let account = empty_account();

    lifecycle.tick_all(&account).await;
    lifecycle.tick_all(&account).await;
    assert_eq!(lifecycle.get(&id).await.unwrap().state, TradeState::Open);

    lifecycle.force_close(&id).await.unwrap();
    assert_eq!(lifecycle.get(&id).await.unwrap().state, TradeState::PendingClose);

    lifecycle.tick_all(&account).await;
    assert_eq!(lifecycle.get(&id).await.unwrap().state, TradeState::Closing);

    lifecycle.force_close(&id).await.unwrap();
    assert_eq!(lifecycle.get(&id).await.unwrap().state, TradeState::PendingClose);
}

#[tokio::test]
async fn rfq_executor_accepts_quote_meeting_improvement_gate() {
    let symbol = "BTC-28FEB26-90000-C";
    let legs = vec![Leg::new(Symbol::new(symbol), dec!(1), Side::Buy)];
    let market_data = FakeMarketData::new().with_book(symbol, dec!(490), dec!(510));
    let quote = json!({
        "quoteId": "q1",
        "requestId": "req-1",
        "state": "OPEN",
        "legs": [{ "side": "SELL", "qty": "1", "price": "495" }],
        "createTime": chrono::Utc::now().timestamp_millis(),
        "expiryTime": chrono::Utc::now().timestamp_millis() + 60_000,
    });
    let transport = FakeTransport::new().with_rfq_quotes(vec![quote]);
    let executor =
        BlockQuoteExecutor::new(RfqExecutorConfig { poll_interval_secs: 0, total_wait_secs: 5, min_improvement_pct: dec!(1) });

    let result = executor.run(&legs, RfqAction::Buy, &transport, &market_data).await.unwrap();
    assert_eq!(result.quote.quote_id, "q1");
    assert_eq!(result.total_cost, dec!(495));
}

#[tokio::test]
async fn rfq_executor_times_out_without_sufficient_improvement() {
    let symbol = "BTC-28FEB26-90000-C";
    let legs = vec![Leg::new(Symbol::new(symbol), dec!(1), Side::Buy)];
    let market_data = FakeMarketData::new().with_book(symbol, dec!(490), dec!(510));
    let quote = json!({
        "quoteId": "q1",
        "requestId": "req-1",
        "state": "OPEN",
        "legs": [{ "side": "SELL", "qty": "1", "price": "509" }],
        "createTime": chrono::Utc::now().timestamp_millis(),
        "expiryTime": chrono::Utc::now().timestamp_millis() + 60_000,
    });
    let transport = FakeTransport::new().with_rfq_quotes(vec![quote]);
    let executor =
        BlockQuoteExecutor::new(RfqExecutorConfig { poll_interval_secs: 0, total_wait_secs: 1, min_improvement_pct: dec!(5) });

    let err = executor.run(&legs, RfqAction::Buy, &transport, &market_data).await.unwrap_err();
    assert!(matches!(err, CoreError::RfqTimeout));
}

#[tokio::test]
async fn smart_executor_fills_multi_leg_structure_in_one_pass() {
    let call_symbol = "BTC-28FEB26-90000-C";
    let put_symbol = "BTC-28FEB26-80000-P";
    let transport = FakeTransport::new();
    let market_data = FakeMarketData::new()
        .with_book(call_symbol, dec!(490), dec!(510))
        .with_book(put_symbol, dec!(190), dec!(210));
    let mut legs = vec![
        Leg::new(Symbol::new(call_symbol), dec!(2), Side::Buy),
        Leg::new(Symbol::new(put_symbol), dec!(2), Side::Sell),
    ];
    let executor = SmartMultiLegExecutor::new(SmartExecConfig { chunk_count: 2, ..SmartExecConfig::default() });
    executor.run(&mut legs, &transport, &market_data).await.unwrap();

    assert!(legs.iter().all(Leg::is_filled));
}
