//! Order/trade management: core types, execution routing, and the three
//! fill strategies the lifecycle manager dispatches to.

pub mod lifecycle;
pub mod limit_fill;
pub mod rfq_executor;
pub mod router;
pub mod smart_executor;
pub mod types;

pub use lifecycle::{ExitPredicate, LifecycleManager};
pub use limit_fill::{LimitFillManager, TickOutcome};
pub use rfq_executor::{BlockQuoteExecutor, RfqExecutorConfig, RfqResult};
pub use router::{ExecutionRouter, RouterConfig};
pub use smart_executor::SmartMultiLegExecutor;
pub use types::{
    ExecutionParams, Leg, Quote, QuoteLeg, QuoteState, QuotingStrategy, RfqAction,
    SmartExecConfig, Trade, TradeMode, TradeState,
};
