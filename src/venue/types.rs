//! Wire types for the venue's order, RFQ, and account endpoints (§6).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Generic envelope every venue endpoint responds with. `code == 0` means
/// success; the core never inspects `data` without checking `code` first.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportResponse {
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Venue order state codes (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum VenueOrderState {
    New = 0,
    Filled = 1,
    PartiallyFilled = 2,
    Canceled = 3,
    PreCancel = 4,
    Canceling = 5,
    Invalid = 6,
    CancelByExercise = 10,
}

impl VenueOrderState {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::New,
            1 => Self::Filled,
            2 => Self::PartiallyFilled,
            3 => Self::Canceled,
            4 => Self::PreCancel,
            5 => Self::Canceling,
            6 => Self::Invalid,
            10 => Self::CancelByExercise,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    #[serde(rename = "tradeSide")]
    pub trade_side: i32,
    #[serde(rename = "tradeType")]
    pub trade_type: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(rename = "clientOrderId", skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl CreateOrderRequest {
    pub fn limit(symbol: impl Into<String>, qty: Decimal, trade_side: i32, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            trade_side,
            trade_type: 1,
            price: Some(price),
            client_order_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryOrderData {
    #[serde(rename = "orderId")]
    pub order_id: String,
    pub symbol: String,
    pub qty: Decimal,
    #[serde(rename = "fillQty")]
    pub fill_qty: Decimal,
    #[serde(rename = "remainQty", default)]
    pub remain_qty: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: Decimal,
    pub state: i32,
    #[serde(rename = "tradeSide")]
    pub trade_side: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RfqLegRequest {
    #[serde(rename = "instrumentName")]
    pub instrument_name: String,
    pub side: String,
    pub qty: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRfqRequest {
    pub legs: Vec<RfqLegRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRfqData {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "expiryTime")]
    pub expiry_time: i64,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueQuoteLeg {
    pub side: String,
    pub qty: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueQuote {
    #[serde(rename = "quoteId")]
    pub quote_id: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub state: String,
    pub legs: Vec<VenueQuoteLeg>,
    #[serde(rename = "createTime")]
    pub create_time: i64,
    #[serde(rename = "expiryTime")]
    pub expiry_time: i64,
}
