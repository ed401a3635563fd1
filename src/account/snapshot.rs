//! Immutable account and position snapshots (§3).

use crate::types::{Greeks, Side, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single position as reported by the venue at a point in time. Immutable
/// — a new poll produces a new snapshot rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub position_id: String,
    pub symbol: Symbol,
    pub qty: Decimal,
    pub side: Side,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub roi: Decimal,
    pub greeks: Greeks,
    pub taken_at: DateTime<Utc>,
}

/// Account state at a single poll tick, shared freely across tasks —
/// nothing about it can change out from under a reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub taken_at: DateTime<Utc>,
    pub equity: Decimal,
    pub available_margin: Decimal,
    pub initial_margin: Decimal,
    pub maintenance_margin: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: Vec<PositionSnapshot>,
}

impl AccountSnapshot {
    pub fn margin_utilization_pct(&self) -> Decimal {
        let total = self.initial_margin + self.available_margin;
        if total.is_zero() {
            Decimal::ZERO
        } else {
            self.initial_margin / total * Decimal::ONE_HUNDRED
        }
    }

    pub fn position_for(&self, symbol: &Symbol) -> Option<&PositionSnapshot> {
        self.positions.iter().find(|p| &p.symbol == symbol)
    }

    pub fn has_position_in(&self, underlying: &str) -> bool {
        self.positions
            .iter()
            .any(|p| p.symbol.as_str().starts_with(underlying))
    }

    /// Aggregated net delta across all positions, signed by side.
    pub fn net_delta(&self) -> Decimal {
        self.aggregate_greeks().delta
    }

    pub fn aggregate_greeks(&self) -> Greeks {
        self.positions.iter().fold(Greeks::default(), |acc, p| {
            let signed_qty = match p.side {
                Side::Buy => p.qty,
                Side::Sell => -p.qty,
            };
            acc + p.greeks * signed_qty
        })
    }

    /// `our_qty`'s pro-rated share of `symbol`'s venue-aggregated Greeks
    /// (§4.2): `min(our_qty / total_qty, 1.0)` of the position's reported
    /// Greeks, so multiple trades sharing one instrument don't double-count
    /// the venue's aggregated position.
    pub fn pro_rated_greeks(&self, symbol: &Symbol, our_qty: Decimal) -> Greeks {
        match self.position_for(symbol) {
            Some(pos) if !pos.qty.is_zero() => pos.greeks * (our_qty / pos.qty).min(Decimal::ONE),
            _ => Greeks::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(symbol: &str, side: Side, delta: i64) -> PositionSnapshot {
        PositionSnapshot {
            position_id: "pos-1".to_string(),
            symbol: Symbol::new(symbol),
            qty: Decimal::ONE,
            side,
            entry_price: Decimal::new(500, 0),
            mark_price: Decimal::new(510, 0),
            unrealized_pnl: Decimal::TEN,
            roi: Decimal::new(2, 2),
            greeks: Greeks {
                delta: Decimal::new(delta, 2),
                ..Greeks::default()
            },
            taken_at: Utc::now(),
        }
    }

    fn snap(initial_margin: i64, available_margin: i64) -> AccountSnapshot {
        AccountSnapshot {
            taken_at: Utc::now(),
            equity: Decimal::new(100_000, 0),
            available_margin: Decimal::new(available_margin, 0),
            initial_margin: Decimal::new(initial_margin, 0),
            maintenance_margin: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            positions: vec![],
        }
    }

    #[test]
    fn margin_utilization_is_zero_with_no_margin() {
        let s = snap(0, 0);
        assert_eq!(s.margin_utilization_pct(), Decimal::ZERO);
    }

    #[test]
    fn margin_utilization_computes_percentage() {
        let s = snap(25, 75);
        assert_eq!(s.margin_utilization_pct(), Decimal::new(25, 0));
    }

    #[test]
    fn has_position_in_matches_underlying_prefix() {
        let mut s = snap(0, 100);
        s.positions.push(position("BTC-28FEB26-90000-C", Side::Buy, 50));
        assert!(s.has_position_in("BTC"));
        assert!(!s.has_position_in("ETH"));
    }

    #[test]
    fn net_delta_nets_opposing_sides() {
        let mut s = snap(0, 100);
        s.positions.push(position("BTC-28FEB26-90000-C", Side::Buy, 50));
        s.positions.push(position("BTC-28FEB26-95000-C", Side::Sell, 50));
        assert_eq!(s.net_delta(), Decimal::ZERO);
    }

    #[test]
    fn pro_rated_greeks_caps_share_at_one() {
        let mut s = snap(0, 100);
        let mut pos = position("BTC-28FEB26-90000-C", Side::Buy, 50);
        pos.qty = Decimal::new(4, 0);
        s.positions.push(pos);

        let symbol = Symbol::new("BTC-28FEB26-90000-C");
        let half = s.pro_rated_greeks(&symbol, Decimal::new(2, 0));
        assert_eq!(half.delta, Decimal::new(25, 2));

        let capped = s.pro_rated_greeks(&symbol, Decimal::new(10, 0));
        assert_eq!(capped.delta, Decimal::new(50, 2));
    }

    #[test]
    fn pro_rated_greeks_is_zero_with_no_position() {
        let s = snap(0, 100);
        let zero = s.pro_rated_greeks(&Symbol::new("ETH-28FEB26-3000-C"), Decimal::ONE);
        assert_eq!(zero.delta, Decimal::ZERO);
    }
}
