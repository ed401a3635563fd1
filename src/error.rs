//! Domain error type for the trading core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("venue rejected request: {0}")]
    VenueRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no orderbook available for {0}")]
    NoOrderbook(String),

    #[error("empty {side} side of orderbook for {symbol}")]
    EmptyBookSide { symbol: String, side: &'static str },

    #[error("order placement failed for {0}")]
    PlacementFailed(String),

    #[error("max requote rounds exhausted with {filled}/{total} filled")]
    RequoteExhausted { filled: String, total: String },

    #[error("rfq timed out with no accepted quote")]
    RfqTimeout,

    #[error("rfq rejected: {0}")]
    RfqRejected(String),

    #[error("invalid leg configuration: {0}")]
    InvalidLeg(String),

    #[error("trade {0} not found")]
    TradeNotFound(String),

    #[error("illegal transition from {from:?} via {action}")]
    IllegalTransition { from: String, action: &'static str },

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
