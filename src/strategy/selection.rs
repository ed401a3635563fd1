//! Option-chain selection (§6: external collaborator, contract only).
//!
//! Strategies declare legs as [`LegTemplate`]s — "30-delta call, nearest
//! weekly expiry" — rather than concrete symbols. An [`OptionSelector`]
//! resolves a template against the live chain. The selection heuristics
//! themselves (delta targeting, strike-distance ranking) are explicitly
//! out of scope; only the contract is specified here.

use crate::error::{CoreError, CoreResult};
use crate::market_data::{InstrumentInfo, MarketDataSource};
use crate::oms::Leg;
use crate::types::Side;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

/// Which numeric criterion picks the strike within the chosen expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StrikeCriterion {
    Delta(Decimal),
    ClosestStrike(Decimal),
    SpotDistancePct(Decimal),
    ExactStrike(Decimal),
}

/// A declarative description of one leg a strategy wants opened, resolved
/// to a concrete [`Leg`] by an [`OptionSelector`] at entry time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegTemplate {
    pub underlying: String,
    pub option_type: OptionType,
    pub days_to_expiry: i64,
    pub strike_criterion: StrikeCriterion,
    pub qty: Decimal,
    pub side: Side,
}

#[async_trait]
pub trait OptionSelector: Send + Sync {
    async fn resolve(&self, template: &LegTemplate) -> CoreResult<Leg>;

    async fn resolve_all(&self, templates: &[LegTemplate]) -> CoreResult<Vec<Leg>> {
        let mut legs = Vec::with_capacity(templates.len());
        for template in templates {
            legs.push(self.resolve(template).await?);
        }
        Ok(legs)
    }
}

/// Nearest-expiry, closest-strike default implementation of
/// [`OptionSelector`]. Ranks the listed chain by distance to
/// `days_to_expiry`, then by whichever [`StrikeCriterion`] the template
/// asks for among contracts at that expiry. This is a reference
/// implementation, not a delta-surface-aware selector — callers with
/// sharper requirements should implement [`OptionSelector`] themselves.
pub struct ChainOptionSelector {
    market_data: Arc<dyn MarketDataSource>,
}

impl ChainOptionSelector {
    pub fn new(market_data: Arc<dyn MarketDataSource>) -> Self {
        Self { market_data }
    }

    fn matches_type(instrument: &InstrumentInfo, option_type: OptionType) -> bool {
        match option_type {
            OptionType::Call => instrument.option_type.eq_ignore_ascii_case("C") || instrument.option_type.eq_ignore_ascii_case("call"),
            OptionType::Put => instrument.option_type.eq_ignore_ascii_case("P") || instrument.option_type.eq_ignore_ascii_case("put"),
        }
    }
}

#[async_trait]
impl OptionSelector for ChainOptionSelector {
    async fn resolve(&self, template: &LegTemplate) -> CoreResult<Leg> {
        let instruments = self.market_data.get_instruments(&template.underlying).await?;
        let candidates: Vec<&InstrumentInfo> = instruments
            .iter()
            .filter(|i| Self::matches_type(i, template.option_type))
            .collect();
        if candidates.is_empty() {
            return Err(CoreError::InvalidLeg(format!(
                "no {:?} instruments listed for {}",
                template.option_type, template.underlying
            )));
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let target_ms = now_ms + template.days_to_expiry * 24 * 60 * 60 * 1000;
        let nearest_expiry = candidates
            .iter()
            .min_by_key(|i| (i.expiry_time_ms - target_ms).abs())
            .map(|i| i.expiry_time_ms)
            .expect("candidates is non-empty");

        let at_expiry: Vec<&InstrumentInfo> = candidates.into_iter().filter(|i| i.expiry_time_ms == nearest_expiry).collect();

        let spot = self
            .market_data
            .get_futures_price(&template.underlying, true)
            .await
            .unwrap_or(Decimal::ZERO);

        let chosen = match &template.strike_criterion {
            StrikeCriterion::ExactStrike(strike) => at_expiry.iter().find(|i| i.strike == *strike),
            StrikeCriterion::ClosestStrike(strike) => at_expiry.iter().min_by_key(|i| (i.strike - *strike).abs()),
            StrikeCriterion::SpotDistancePct(pct) => {
                let target_strike = spot * (Decimal::ONE + *pct / Decimal::ONE_HUNDRED);
                at_expiry.iter().min_by_key(|i| (i.strike - target_strike).abs())
            }
            StrikeCriterion::Delta(_target_delta) => {
                // Ranking by delta needs per-contract Greeks, which the
                // chain listing doesn't carry; fall back to at-the-money.
                at_expiry.iter().min_by_key(|i| (i.strike - spot).abs())
            }
        };

        let instrument = chosen.ok_or_else(|| {
            CoreError::InvalidLeg(format!("no instrument matched strike criterion for {}", template.underlying))
        })?;

        Ok(Leg::new(instrument.symbol.clone(), template.qty, template.side))
    }
}
