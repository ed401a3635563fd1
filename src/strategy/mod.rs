//! Declarative strategy configuration: entry/exit predicates, leg template
//! selection, and the per-strategy runner that ties them to the lifecycle
//! manager.

pub mod predicates;
pub mod runner;
pub mod selection;

pub use predicates::{Comparison, EntryPredicate, EntryPredicateSpec, ExitPredicateSpec, GreekName};
pub use runner::{OnTradeClosed, StrategyConfig, StrategyRunner, StrategyRunnerRegistry, StrategyStats};
pub use selection::{ChainOptionSelector, LegTemplate, OptionSelector, OptionType, StrikeCriterion};
