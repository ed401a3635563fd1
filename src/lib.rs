//! Multi-leg options execution daemon.
//!
//! Polls account state from a single venue, routes each declared trade to
//! a limit, RFQ, or smart multi-leg executor depending on its notional,
//! and drives every trade through its lifecycle state machine until it is
//! closed or fails. Strategies are declarative: entry/exit predicates and
//! leg templates, not imperative trading loops.

pub mod account;
pub mod common;
pub mod config;
pub mod error;
pub mod market_data;
pub mod oms;
pub mod persistence;
pub mod strategy;
pub mod types;
pub mod venue;

pub use account::{AccountPoller, AccountSnapshot, PositionSnapshot};
pub use config::AppConfig;
pub use error::{CoreError, CoreResult};
pub use market_data::{HttpMarketDataSource, MarketDataSource};
pub use oms::{LifecycleManager, Trade, TradeState};
pub use persistence::TradeStatePersistence;
pub use strategy::{StrategyRunner, StrategyRunnerRegistry};
pub use types::{Greeks, Side, Symbol};
pub use venue::{Credentials, HttpVenueTransport, VenueTransport};
