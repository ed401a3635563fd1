//! Core OMS types
//!
//! Defines legs, trades, their lifecycle states, and the per-trade
//! execution tuning that governs how the fill manager, smart executor, and
//! RFQ executor behave.

use crate::types::{Side, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A single order intent within a trade. Mutated progressively by the
/// executor that owns it: `order_id` is attached when placed, `filled_qty`
/// and `avg_fill_price` update as executions land. Once placed, `symbol`,
/// `qty`, and `side` never change — only the fill fields and order id do.
/// `closed_qty` lives only on legs inside `Trade::open_legs`: it tracks how
/// much of this leg has already been reversed by a prior close attempt, so
/// a retried close never re-submits size that's already been dealt with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub symbol: Symbol,
    pub qty: Decimal,
    pub side: Side,
    pub order_id: Option<String>,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    #[serde(default)]
    pub closed_qty: Decimal,
}

impl Leg {
    pub fn new(symbol: Symbol, qty: Decimal, side: Side) -> Self {
        Self {
            symbol,
            qty,
            side,
            order_id: None,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            closed_qty: Decimal::ZERO,
        }
    }

    pub fn remaining_qty(&self) -> Decimal {
        (self.qty - self.filled_qty).max(Decimal::ZERO)
    }

    pub fn is_filled(&self) -> bool {
        self.filled_qty >= self.qty
    }

    /// How much of this leg's fill is still outstanding to be closed —
    /// the sole defence against double-ordering on a retried close (§4.2).
    pub fn remaining_to_close(&self) -> Decimal {
        (self.filled_qty - self.closed_qty).max(Decimal::ZERO)
    }

    /// The leg that unwinds whatever portion of this one hasn't already
    /// been closed — reversed side, fresh fill history.
    pub fn reversed_for_close(&self) -> Leg {
        Leg::new(self.symbol.clone(), self.remaining_to_close(), self.side.reversed())
    }
}

/// Trade lifecycle state (§3). Transitions form a DAG with no path back to
/// `PendingOpen`; every state may move to `Failed` on an unrecoverable
/// error. `Closing` may retreat to `PendingClose` on a retryable failure,
/// and `Opening` may move to `PendingClose` to unwind a partial fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeState {
    PendingOpen,
    Opening,
    Open,
    PendingClose,
    Closing,
    Closed,
    Failed,
}

impl TradeState {
    /// Whether `action` from this state is one of the legal transitions
    /// described in §3's state graph.
    pub fn can_transition_to(self, next: TradeState) -> bool {
        use TradeState::*;
        match (self, next) {
            (_, Failed) => true,
            (PendingOpen, Opening) => true,
            (Opening, Open) => true,
            (Opening, PendingClose) => true,
            (Open, PendingClose) => true,
            (PendingClose, Closing) => true,
            (Closing, Closed) => true,
            (Closing, PendingClose) => true,
            _ => false,
        }
    }
}

/// How a trade's legs are routed to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeMode {
    Limit,
    Rfq,
    Smart,
    Unresolved,
}

/// Which side of the structure as a whole the RFQ executor is taking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfqAction {
    Buy,
    Sell,
}

/// Per-trade tuning for the limit-fill manager (§3, §4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionParams {
    pub fill_timeout_secs: u64,
    pub aggressive_buffer_pct: Decimal,
    pub max_requote_rounds: u32,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            fill_timeout_secs: 30,
            aggressive_buffer_pct: Decimal::new(1, 2),
            max_requote_rounds: 5,
        }
    }
}

/// Quoting reference for the smart executor (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotingStrategy {
    TopOfBook,
    TopOfBookWithOffset,
    Mid,
    Mark,
}

/// Per-trade tuning for the smart multi-leg executor (§3, §4.4). Invalid
/// values are not rejected outright — `validate` clamps them to safe
/// minimums and falls back unknown strategies to `TopOfBook`, matching
/// §3's "Validation" note.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SmartExecConfig {
    pub chunk_count: u32,
    pub time_per_chunk_secs: u64,
    pub quoting_strategy: QuotingStrategy,
    pub spread_offset_pct: Decimal,
    pub reprice_interval_secs: u64,
    pub min_price_change: Decimal,
    pub min_order_size: Decimal,
    pub aggressive_fallback_attempts: u32,
    pub aggressive_wait_secs: u64,
    pub pause_between_attempts_secs: u64,
}

impl Default for SmartExecConfig {
    fn default() -> Self {
        Self {
            chunk_count: 4,
            time_per_chunk_secs: 120,
            quoting_strategy: QuotingStrategy::TopOfBook,
            spread_offset_pct: Decimal::ZERO,
            reprice_interval_secs: 15,
            min_price_change: Decimal::new(1, 4),
            min_order_size: Decimal::ZERO,
            aggressive_fallback_attempts: 3,
            aggressive_wait_secs: 5,
            pause_between_attempts_secs: 2,
        }
    }
}

impl SmartExecConfig {
    const MIN_REPRICE_INTERVAL_SECS: u64 = 10;
    const MIN_TIME_PER_CHUNK_SECS: u64 = 10;

    /// Clamp reprice interval and time-per-chunk to safe minimums. Called
    /// once when a trade's execution mode resolves to `Smart`.
    pub fn validate(mut self) -> Self {
        if self.reprice_interval_secs < Self::MIN_REPRICE_INTERVAL_SECS {
            tracing::warn!(
                requested = self.reprice_interval_secs,
                clamped = Self::MIN_REPRICE_INTERVAL_SECS,
                "reprice interval below safe minimum, clamping"
            );
            self.reprice_interval_secs = Self::MIN_REPRICE_INTERVAL_SECS;
        }
        if self.time_per_chunk_secs < Self::MIN_TIME_PER_CHUNK_SECS {
            tracing::warn!(
                requested = self.time_per_chunk_secs,
                clamped = Self::MIN_TIME_PER_CHUNK_SECS,
                "time per chunk below safe minimum, clamping"
            );
            self.time_per_chunk_secs = Self::MIN_TIME_PER_CHUNK_SECS;
        }
        self
    }
}

/// A group of legs managed as one unit, e.g. a 4-leg iron condor. Owned
/// exclusively by the lifecycle manager; a strategy runner holds a
/// reference, never ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub strategy_id: String,
    pub state: TradeState,
    pub open_legs: Vec<Leg>,
    pub close_legs: Vec<Leg>,
    pub mode: TradeMode,
    pub rfq_action: RfqAction,
    pub execution_params: ExecutionParams,
    pub smart_exec_config: Option<SmartExecConfig>,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl Trade {
    pub fn new(strategy_id: impl Into<String>, open_legs: Vec<Leg>, rfq_action: RfqAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy_id: strategy_id.into(),
            state: TradeState::PendingOpen,
            open_legs,
            close_legs: Vec::new(),
            mode: TradeMode::Unresolved,
            rfq_action,
            execution_params: ExecutionParams::default(),
            smart_exec_config: None,
            created_at: Utc::now(),
            opened_at: None,
            closed_at: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Fold whatever the outgoing `close_legs` achieved back onto the open
    /// legs' `closed_qty` before they're discarded. Must run before
    /// `rebuild_close_legs` replaces `close_legs`, or a partial close's
    /// progress is forgotten and the next retry re-submits the full size.
    pub fn sync_close_progress(&mut self) {
        for close_leg in &self.close_legs {
            if let Some(open_leg) = self
                .open_legs
                .iter_mut()
                .find(|o| o.symbol == close_leg.symbol && o.side == close_leg.side.reversed())
            {
                open_leg.closed_qty += close_leg.filled_qty;
            }
        }
    }

    /// Build this trade's close legs fresh, reversing every open leg's
    /// still-outstanding (unclosed) quantity. Called on every close
    /// attempt — never reused across retries, per §3 invariant (c). Legs
    /// with nothing left to close are dropped.
    pub fn rebuild_close_legs(&mut self) {
        self.close_legs = self
            .open_legs
            .iter()
            .filter(|l| l.remaining_to_close() > Decimal::ZERO)
            .map(Leg::reversed_for_close)
            .collect();
    }

    pub fn transition(&mut self, next: TradeState) -> Result<(), crate::error::CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(crate::error::CoreError::IllegalTransition {
                from: format!("{:?}", self.state),
                action: state_name(next),
            });
        }
        match next {
            TradeState::Open if self.opened_at.is_none() => self.opened_at = Some(Utc::now()),
            TradeState::Closed if self.closed_at.is_none() => self.closed_at = Some(Utc::now()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.state = TradeState::Failed;
    }

    pub fn is_single_leg(&self) -> bool {
        self.open_legs.len() == 1
    }
}

fn state_name(state: TradeState) -> &'static str {
    match state {
        TradeState::PendingOpen => "PendingOpen",
        TradeState::Opening => "Opening",
        TradeState::Open => "Open",
        TradeState::PendingClose => "PendingClose",
        TradeState::Closing => "Closing",
        TradeState::Closed => "Closed",
        TradeState::Failed => "Failed",
    }
}

/// A market maker's leg-by-leg pricing on a block quote. `side` is from the
/// maker's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteLeg {
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteState {
    Open,
    Cancelled,
    Filled,
}

/// A block-quote response from a market maker (§3). Ephemeral — owned by
/// the RFQ executor call that produced it, never persisted independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: String,
    pub request_id: String,
    pub state: QuoteState,
    pub legs: Vec<QuoteLeg>,
    pub created_at: DateTime<Utc>,
    pub expiry_time_ms: i64,
}

impl Quote {
    /// Sum of `price × qty` across legs, flipping sign when the maker's
    /// leg-side is buy (the taker sells and receives credit). Positive
    /// means the taker pays to execute.
    pub fn total_cost(&self) -> Decimal {
        self.legs.iter().fold(Decimal::ZERO, |acc, leg| {
            let signed = match leg.side {
                Side::Sell => leg.price * leg.qty,
                Side::Buy => -(leg.price * leg.qty),
            };
            acc + signed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn leg_reversed_for_close_flips_side_and_resets_fills() {
        let mut leg = Leg::new(Symbol::new("BTC-X"), dec!(2), Side::Buy);
        leg.filled_qty = dec!(2);
        let r = leg.reversed_for_close();
        assert_eq!(r.side, Side::Sell);
        assert_eq!(r.qty, dec!(2));
        assert_eq!(r.filled_qty, Decimal::ZERO);
    }

    #[test]
    fn reversed_for_close_only_asks_for_the_unclosed_remainder() {
        let mut leg = Leg::new(Symbol::new("BTC-X"), dec!(2), Side::Buy);
        leg.filled_qty = dec!(2);
        leg.closed_qty = dec!(0.5);
        let r = leg.reversed_for_close();
        assert_eq!(r.qty, dec!(1.5));
    }

    #[test]
    fn leg_is_filled_when_filled_qty_meets_qty() {
        let mut leg = Leg::new(Symbol::new("BTC-X"), dec!(1), Side::Buy);
        assert!(!leg.is_filled());
        leg.filled_qty = dec!(1);
        assert!(leg.is_filled());
    }

    #[test]
    fn legal_transitions_follow_the_state_graph() {
        use TradeState::*;
        assert!(PendingOpen.can_transition_to(Opening));
        assert!(!PendingOpen.can_transition_to(Open));
        assert!(Opening.can_transition_to(PendingClose));
        assert!(Closing.can_transition_to(PendingClose));
        assert!(Open.can_transition_to(Failed));
        assert!(!Closed.can_transition_to(PendingOpen));
    }

    #[test]
    fn trade_sets_opened_and_closed_at_exactly_once() {
        let leg = Leg::new(Symbol::new("BTC-X"), dec!(1), Side::Buy);
        let mut trade = Trade::new("strat-1", vec![leg], RfqAction::Buy);
        trade.transition(TradeState::Opening).unwrap();
        trade.transition(TradeState::Open).unwrap();
        assert!(trade.opened_at.is_some());
        let first = trade.opened_at;
        trade.transition(TradeState::PendingClose).unwrap();
        trade.transition(TradeState::Closing).unwrap();
        trade.transition(TradeState::Closed).unwrap();
        assert_eq!(trade.opened_at, first);
        assert!(trade.closed_at.is_some());
    }

    #[test]
    fn rebuild_close_legs_is_idempotent_across_retries() {
        let leg = Leg::new(Symbol::new("BTC-X"), dec!(1), Side::Buy);
        let mut trade = Trade::new("strat-1", vec![leg], RfqAction::Buy);
        trade.rebuild_close_legs();
        trade.close_legs[0].filled_qty = dec!(1);
        trade.rebuild_close_legs();
        assert_eq!(trade.close_legs[0].filled_qty, Decimal::ZERO);
    }

    #[test]
    fn rebuild_close_legs_does_not_double_order_across_a_partial_close_retry() {
        let mut leg = Leg::new(Symbol::new("BTC-X"), dec!(10), Side::Buy);
        leg.filled_qty = dec!(10);
        let mut trade = Trade::new("strat-1", vec![leg], RfqAction::Buy);

        // First close attempt: asks for the full filled size.
        trade.rebuild_close_legs();
        assert_eq!(trade.close_legs[0].qty, dec!(10));

        // Only 6 of the 10 close, then the close attempt is retried.
        trade.close_legs[0].filled_qty = dec!(6);
        trade.sync_close_progress();
        assert_eq!(trade.open_legs[0].closed_qty, dec!(6));

        trade.rebuild_close_legs();
        assert_eq!(trade.close_legs[0].qty, dec!(4));

        // The remaining 4 close; a third rebuild has nothing left to ask for.
        trade.close_legs[0].filled_qty = dec!(4);
        trade.sync_close_progress();
        trade.rebuild_close_legs();
        assert!(trade.close_legs.is_empty());
    }

    #[test]
    fn quote_total_cost_flips_sign_for_maker_buy_legs() {
        let quote = Quote {
            quote_id: "q1".to_string(),
            request_id: "r1".to_string(),
            state: QuoteState::Open,
            legs: vec![
                QuoteLeg {
                    side: Side::Sell,
                    qty: dec!(1),
                    price: dec!(500),
                },
                QuoteLeg {
                    side: Side::Buy,
                    qty: dec!(1),
                    price: dec!(100),
                },
            ],
            created_at: Utc::now(),
            expiry_time_ms: 0,
        };
        assert_eq!(quote.total_cost(), dec!(400));
    }

    #[test]
    fn smart_exec_config_clamps_unsafe_values() {
        let cfg = SmartExecConfig {
            reprice_interval_secs: 1,
            time_per_chunk_secs: 1,
            ..SmartExecConfig::default()
        }
        .validate();
        assert_eq!(cfg.reprice_interval_secs, SmartExecConfig::MIN_REPRICE_INTERVAL_SECS);
        assert_eq!(cfg.time_per_chunk_secs, SmartExecConfig::MIN_TIME_PER_CHUNK_SECS);
    }
}
