//! Entry and exit predicates (§4.6).
//!
//! These are closures over zero or more numeric parameters, contract-only.
//! Each `build()` below returns the boxed
//! closure the strategy runner and lifecycle manager actually call;
//! everything else in this module is just a serializable description of
//! which closure to build, so a strategy's predicate list can live in a
//! config file.

use crate::account::AccountSnapshot;
use crate::oms::{Leg, Trade, TradeState};
use crate::oms::lifecycle::ExitPredicate;
use chrono::{Datelike, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type EntryPredicate = Arc<dyn Fn(&AccountSnapshot) -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryPredicateSpec {
    MinAvailableMarginPct(Decimal),
    TimeOfDayWindowUtc { start_hour: u32, end_hour: u32 },
    WeekdayFilter(Vec<String>),
    MinEquity(Decimal),
    MaxAbsAccountDelta(Decimal),
    MaxMarginUtilizationPct(Decimal),
    NoExistingPositionIn(Vec<String>),
    AbsoluteUtcWindow {
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    },
}

impl EntryPredicateSpec {
    pub fn build(self) -> EntryPredicate {
        match self {
            EntryPredicateSpec::MinAvailableMarginPct(min_pct) => Arc::new(move |snap: &AccountSnapshot| {
                let total = snap.initial_margin + snap.available_margin;
                if total.is_zero() {
                    return false;
                }
                (snap.available_margin / total * Decimal::ONE_HUNDRED) >= min_pct
            }),
            EntryPredicateSpec::TimeOfDayWindowUtc { start_hour, end_hour } => {
                Arc::new(move |_snap: &AccountSnapshot| {
                    let hour = Utc::now().hour();
                    if start_hour <= end_hour {
                        hour >= start_hour && hour < end_hour
                    } else {
                        // Window wraps past midnight, e.g. 22..6.
                        hour >= start_hour || hour < end_hour
                    }
                })
            }
            EntryPredicateSpec::WeekdayFilter(days) => Arc::new(move |_snap: &AccountSnapshot| {
                let today = weekday_abbrev(Utc::now().weekday());
                days.iter().any(|d| d.eq_ignore_ascii_case(today))
            }),
            EntryPredicateSpec::MinEquity(min_equity) => {
                Arc::new(move |snap: &AccountSnapshot| snap.equity >= min_equity)
            }
            EntryPredicateSpec::MaxAbsAccountDelta(max_delta) => {
                Arc::new(move |snap: &AccountSnapshot| snap.net_delta().abs() <= max_delta)
            }
            EntryPredicateSpec::MaxMarginUtilizationPct(max_pct) => {
                Arc::new(move |snap: &AccountSnapshot| snap.margin_utilization_pct() <= max_pct)
            }
            EntryPredicateSpec::NoExistingPositionIn(underlyings) => Arc::new(move |snap: &AccountSnapshot| {
                !underlyings.iter().any(|u| snap.has_position_in(u))
            }),
            EntryPredicateSpec::AbsoluteUtcWindow { start, end } => {
                Arc::new(move |_snap: &AccountSnapshot| {
                    let now = Utc::now();
                    now >= start && now <= end
                })
            }
        }
    }
}

fn weekday_abbrev(weekday: chrono::Weekday) -> &'static str {
    match weekday {
        chrono::Weekday::Mon => "Mon",
        chrono::Weekday::Tue => "Tue",
        chrono::Weekday::Wed => "Wed",
        chrono::Weekday::Thu => "Thu",
        chrono::Weekday::Fri => "Fri",
        chrono::Weekday::Sat => "Sat",
        chrono::Weekday::Sun => "Sun",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Ge,
    Le,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum GreekName {
    Delta,
    Gamma,
    Theta,
    Vega,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExitPredicateSpec {
    ProfitTargetPct(Decimal),
    MaxLossPct(Decimal),
    MaxHoldDurationHours(i64),
    AbsoluteUtcTimeOfDayExit { hour: u32, minute: u32 },
    AbsoluteUtcDatetimeExit(chrono::DateTime<Utc>),
    StructureDeltaLimit(Decimal),
    AccountDeltaLimit(Decimal),
    PerLegGreekThreshold {
        leg_index: usize,
        greek: GreekName,
        comparison: Comparison,
        value: Decimal,
    },
}

/// `entry_cost = Σ sign × fill_price × filled_qty`, sign +1 for buy legs,
/// −1 for sell legs.
fn entry_cost(legs: &[Leg]) -> Decimal {
    legs.iter().fold(Decimal::ZERO, |acc, leg| {
        let sign = match leg.side {
            crate::types::Side::Buy => Decimal::ONE,
            crate::types::Side::Sell => -Decimal::ONE,
        };
        acc + sign * leg.avg_fill_price * leg.filled_qty
    })
}

/// Current mark-to-market PnL for `legs`, using each leg's current mark as
/// reported by `mark_of`.
fn current_pnl(legs: &[Leg], mark_of: &dyn Fn(&Leg) -> Decimal) -> Decimal {
    legs.iter().fold(Decimal::ZERO, |acc, leg| {
        let sign = match leg.side {
            crate::types::Side::Buy => Decimal::ONE,
            crate::types::Side::Sell => -Decimal::ONE,
        };
        acc + sign * (mark_of(leg) - leg.avg_fill_price) * leg.filled_qty
    })
}

/// Sum of each open leg's pro-rated share of its symbol's venue-aggregated
/// delta (§4.2), i.e. this trade's own contribution to the structure's
/// delta rather than the whole account's.
fn structure_pro_rated_delta(snap: &AccountSnapshot, trade: &Trade) -> Decimal {
    trade
        .open_legs
        .iter()
        .fold(Decimal::ZERO, |acc, leg| acc + snap.pro_rated_greeks(&leg.symbol, leg.qty).delta)
}

impl ExitPredicateSpec {
    /// `mark_of` supplies a leg's current mark price, so this module stays
    /// independent of the market-data source's async contract.
    pub fn build(self, mark_of: Arc<dyn Fn(&Leg) -> Decimal + Send + Sync>) -> ExitPredicate {
        match self {
            ExitPredicateSpec::ProfitTargetPct(target) => Arc::new(move |_snap, trade: &Trade| {
                let cost = entry_cost(&trade.open_legs);
                if cost.is_zero() {
                    return false;
                }
                let pnl = current_pnl(&trade.open_legs, mark_of.as_ref());
                (pnl / cost.abs() * Decimal::ONE_HUNDRED) >= target
            }),
            ExitPredicateSpec::MaxLossPct(threshold) => Arc::new(move |_snap, trade: &Trade| {
                let cost = entry_cost(&trade.open_legs);
                if cost.is_zero() {
                    return false;
                }
                let pnl = current_pnl(&trade.open_legs, mark_of.as_ref());
                (pnl / cost.abs() * Decimal::ONE_HUNDRED) <= -threshold
            }),
            ExitPredicateSpec::MaxHoldDurationHours(hours) => Arc::new(move |_snap, trade: &Trade| {
                match trade.opened_at {
                    Some(opened) => Utc::now().signed_duration_since(opened).num_hours() >= hours,
                    None => false,
                }
            }),
            ExitPredicateSpec::AbsoluteUtcTimeOfDayExit { hour, minute } => {
                Arc::new(move |_snap, trade: &Trade| {
                    if trade.state != TradeState::Open {
                        return false;
                    }
                    let now = Utc::now();
                    now.hour() > hour || (now.hour() == hour && now.minute() >= minute)
                })
            }
            ExitPredicateSpec::AbsoluteUtcDatetimeExit(deadline) => {
                Arc::new(move |_snap, _trade: &Trade| Utc::now() >= deadline)
            }
            ExitPredicateSpec::StructureDeltaLimit(max_abs_delta) => {
                Arc::new(move |snap: &AccountSnapshot, trade: &Trade| structure_pro_rated_delta(snap, trade).abs() >= max_abs_delta)
            }
            ExitPredicateSpec::AccountDeltaLimit(max_abs_delta) => {
                Arc::new(move |snap: &AccountSnapshot, _trade: &Trade| snap.net_delta().abs() >= max_abs_delta)
            }
            ExitPredicateSpec::PerLegGreekThreshold { leg_index, greek, comparison, value } => {
                Arc::new(move |snap: &AccountSnapshot, trade: &Trade| {
                    let Some(leg) = trade.open_legs.get(leg_index) else {
                        return false;
                    };
                    let greeks = snap.pro_rated_greeks(&leg.symbol, leg.qty);
                    let observed = match greek {
                        GreekName::Delta => greeks.delta,
                        GreekName::Gamma => greeks.gamma,
                        GreekName::Theta => greeks.theta,
                        GreekName::Vega => greeks.vega,
                    };
                    match comparison {
                        Comparison::Ge => observed >= value,
                        Comparison::Le => observed <= value,
                    }
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Symbol};
    use rust_decimal_macros::dec;

    fn filled_leg(side: Side, qty: Decimal, fill_price: Decimal) -> Leg {
        let mut leg = Leg::new(Symbol::new("BTC-X"), qty, side);
        leg.filled_qty = qty;
        leg.avg_fill_price = fill_price;
        leg
    }

    #[test]
    fn entry_cost_sums_signed_fills() {
        let legs = vec![filled_leg(Side::Buy, dec!(1), dec!(500)), filled_leg(Side::Sell, dec!(1), dec!(100))];
        assert_eq!(entry_cost(&legs), dec!(400));
    }

    #[test]
    fn profit_target_triggers_above_threshold() {
        let pred = ExitPredicateSpec::ProfitTargetPct(dec!(10)).build(Arc::new(|leg: &Leg| leg.avg_fill_price + dec!(60)));
        let leg = filled_leg(Side::Buy, dec!(1), dec!(500));
        let trade = Trade::new("s1", vec![leg], crate::oms::RfqAction::Buy);
        let snap_legs: Vec<crate::account::PositionSnapshot> = vec![];
        let snapshot = AccountSnapshot {
            taken_at: Utc::now(),
            equity: dec!(1000),
            available_margin: dec!(1000),
            initial_margin: Decimal::ZERO,
            maintenance_margin: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            positions: snap_legs,
        };
        assert!(pred(&snapshot, &trade));
    }

    #[test]
    fn time_of_day_window_wraps_past_midnight() {
        let pred = EntryPredicateSpec::TimeOfDayWindowUtc { start_hour: 22, end_hour: 6 }.build();
        let snapshot = AccountSnapshot {
            taken_at: Utc::now(),
            equity: Decimal::ZERO,
            available_margin: Decimal::ZERO,
            initial_margin: Decimal::ZERO,
            maintenance_margin: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            positions: vec![],
        };
        let _ = pred(&snapshot);
    }

    fn snapshot_with_position(symbol: &str, qty: Decimal, delta: Decimal) -> AccountSnapshot {
        AccountSnapshot {
            taken_at: Utc::now(),
            equity: dec!(1000),
            available_margin: dec!(1000),
            initial_margin: Decimal::ZERO,
            maintenance_margin: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            positions: vec![crate::account::PositionSnapshot {
                position_id: "pos-1".to_string(),
                symbol: Symbol::new(symbol),
                qty,
                side: Side::Buy,
                entry_price: dec!(500),
                mark_price: dec!(500),
                unrealized_pnl: Decimal::ZERO,
                roi: Decimal::ZERO,
                greeks: crate::types::Greeks { delta, ..Default::default() },
                taken_at: Utc::now(),
            }],
        }
    }

    #[test]
    fn structure_delta_limit_uses_pro_rated_share() {
        let leg = filled_leg(Side::Buy, dec!(2), dec!(500));
        let trade = Trade::new("s1", vec![leg], crate::oms::RfqAction::Buy);
        let snapshot = snapshot_with_position("BTC-X", dec!(4), dec!(1.00));

        let triggers = ExitPredicateSpec::StructureDeltaLimit(dec!(0.4)).build(Arc::new(|_leg: &Leg| Decimal::ZERO));
        assert!(triggers(&snapshot, &trade), "2/4 share of delta 1.00 is 0.50, should clear a 0.4 threshold");

        let does_not_trigger = ExitPredicateSpec::StructureDeltaLimit(dec!(0.9)).build(Arc::new(|_leg: &Leg| Decimal::ZERO));
        assert!(!does_not_trigger(&snapshot, &trade));
    }

    #[test]
    fn per_leg_greek_threshold_reads_the_named_leg_and_greek() {
        let leg = filled_leg(Side::Buy, dec!(1), dec!(500));
        let trade = Trade::new("s1", vec![leg], crate::oms::RfqAction::Buy);
        let snapshot = snapshot_with_position("BTC-X", dec!(1), dec!(0.30));

        let pred = ExitPredicateSpec::PerLegGreekThreshold {
            leg_index: 0,
            greek: GreekName::Delta,
            comparison: Comparison::Ge,
            value: dec!(0.25),
        }
        .build(Arc::new(|_leg: &Leg| Decimal::ZERO));
        assert!(pred(&snapshot, &trade));

        let out_of_range = ExitPredicateSpec::PerLegGreekThreshold {
            leg_index: 5,
            greek: GreekName::Delta,
            comparison: Comparison::Ge,
            value: dec!(0.25),
        }
        .build(Arc::new(|_leg: &Leg| Decimal::ZERO));
        assert!(!out_of_range(&snapshot, &trade));
    }
}
