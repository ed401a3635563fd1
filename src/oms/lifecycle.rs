//! Lifecycle state machine (§4.2): owns the invariants of trade
//! progression, dispatches to the limit-fill manager, smart executor, and
//! RFQ executor, evaluates exit predicates, and persists state snapshots.
//!
//! Exit predicates are closures and therefore cannot ride along on the
//! serializable [`Trade`] the way §3 describes them informally — §6's
//! persisted snapshot never includes them anyway, so they're kept
//! alongside the trade in [`ManagedTrade`] instead of on `Trade` itself.

use crate::account::AccountSnapshot;
use crate::error::{CoreError, CoreResult};
use crate::market_data::MarketDataSource;
use crate::oms::limit_fill::{LimitFillManager, TickOutcome};
use crate::oms::rfq_executor::BlockQuoteExecutor;
use crate::oms::router::ExecutionRouter;
use crate::oms::smart_executor::SmartMultiLegExecutor;
use crate::oms::types::{Leg, Trade, TradeMode, TradeState};
use crate::persistence::TradeStatePersistence;
use crate::venue::VenueTransport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type ExitPredicate = Arc<dyn Fn(&AccountSnapshot, &Trade) -> bool + Send + Sync>;

struct ManagedTrade {
    trade: Trade,
    exit_predicates: Vec<ExitPredicate>,
    fill_manager: Option<LimitFillManager>,
}

/// The trade map is confined to one manager instance and never locked
/// per-trade — all transitions for a given trade happen inside a single
/// `tick_all` pass, mirroring §5's locking discipline.
pub struct LifecycleManager {
    transport: Arc<dyn VenueTransport>,
    market_data: Arc<dyn MarketDataSource>,
    router: ExecutionRouter,
    rfq_executor: BlockQuoteExecutor,
    persistence: TradeStatePersistence,
    trades: RwLock<HashMap<String, ManagedTrade>>,
}

impl LifecycleManager {
    pub fn new(
        transport: Arc<dyn VenueTransport>,
        market_data: Arc<dyn MarketDataSource>,
        router: ExecutionRouter,
        rfq_executor: BlockQuoteExecutor,
        persistence: TradeStatePersistence,
    ) -> Self {
        Self {
            transport,
            market_data,
            router,
            rfq_executor,
            persistence,
            trades: RwLock::new(HashMap::new()),
        }
    }

    pub async fn open(&self, trade: Trade, exit_predicates: Vec<ExitPredicate>) -> String {
        let id = trade.id.clone();
        let mut trades = self.trades.write().await;
        trades.insert(
            id.clone(),
            ManagedTrade {
                trade,
                exit_predicates,
                fill_manager: None,
            },
        );
        id
    }

    pub async fn get(&self, id: &str) -> Option<Trade> {
        self.trades.read().await.get(id).map(|m| m.trade.clone())
    }

    pub async fn active_trades_for(&self, strategy_id: &str) -> Vec<Trade> {
        self.trades
            .read()
            .await
            .values()
            .filter(|m| m.trade.strategy_id == strategy_id)
            .filter(|m| !matches!(m.trade.state, TradeState::Closed | TradeState::Failed))
            .map(|m| m.trade.clone())
            .collect()
    }

    pub async fn trades_for(&self, strategy_id: &str) -> Vec<Trade> {
        self.trades
            .read()
            .await
            .values()
            .filter(|m| m.trade.strategy_id == strategy_id)
            .map(|m| m.trade.clone())
            .collect()
    }

    /// Drive every non-terminal trade through one pass of the state
    /// machine, then persist a snapshot of all trades (throttled).
    pub async fn tick_all(&self, account: &AccountSnapshot) {
        let mut trades = self.trades.write().await;
        for managed in trades.values_mut() {
            if matches!(managed.trade.state, TradeState::Closed | TradeState::Failed) {
                continue;
            }
            if let Err(e) = self.tick_one(managed, account).await {
                tracing::error!(trade_id = %managed.trade.id, error = %e, "lifecycle tick failed");
                managed.trade.fail(e.to_string());
            }
        }
        let snapshot: Vec<Trade> = trades.values().map(|m| m.trade.clone()).collect();
        drop(trades);
        if let Err(e) = self.persistence.maybe_write(&snapshot).await {
            tracing::warn!(error = %e, "trade state persistence write failed");
        }
    }

    async fn tick_one(&self, managed: &mut ManagedTrade, account: &AccountSnapshot) -> CoreResult<()> {
        match managed.trade.state {
            TradeState::PendingOpen => self.dispatch_open(managed).await,
            TradeState::Opening => self.check_open_progress(managed).await,
            TradeState::Open => self.evaluate_exits(managed, account).await,
            TradeState::PendingClose => self.dispatch_close(managed).await,
            TradeState::Closing => self.check_close_progress(managed).await,
            TradeState::Closed | TradeState::Failed => Ok(()),
        }
    }

    async fn dispatch_open(&self, managed: &mut ManagedTrade) -> CoreResult<()> {
        if managed.trade.mode == TradeMode::Unresolved {
            managed.trade.mode = self
                .router
                .route(&managed.trade.open_legs, self.market_data.as_ref())
                .await;
            if managed.trade.mode == TradeMode::Smart && managed.trade.smart_exec_config.is_none() {
                managed.trade.smart_exec_config = Some(Default::default());
            }
        }

        managed.trade.transition(TradeState::Opening)?;
        self.dispatch_open_for_mode(managed).await
    }

    /// Places orders for `managed.trade.open_legs` under whatever mode is
    /// currently set. Split out of [`Self::dispatch_open`] so an RFQ
    /// fallback can re-enter the same placement logic for its new mode
    /// instead of only flipping `trade.mode` and leaving the trade stuck
    /// in `Opening` with nothing driving it.
    async fn dispatch_open_for_mode(&self, managed: &mut ManagedTrade) -> CoreResult<()> {
        match managed.trade.mode {
            TradeMode::Limit => {
                let mut mgr = LimitFillManager::new(managed.trade.execution_params);
                match mgr
                    .place_all(&mut managed.trade.open_legs, self.transport.as_ref(), self.market_data.as_ref())
                    .await
                {
                    Ok(()) => managed.fill_manager = Some(mgr),
                    Err(e) => managed.trade.fail(e.to_string()),
                }
            }
            TradeMode::Smart => {
                let exec = SmartMultiLegExecutor::new(managed.trade.smart_exec_config.unwrap_or_default());
                exec.run(&mut managed.trade.open_legs, self.transport.as_ref(), self.market_data.as_ref())
                    .await?;
                self.finish_open(managed);
            }
            TradeMode::Rfq => {
                match self
                    .rfq_executor
                    .run(
                        &managed.trade.open_legs,
                        managed.trade.rfq_action,
                        self.transport.as_ref(),
                        self.market_data.as_ref(),
                    )
                    .await
                {
                    Ok(result) => {
                        apply_quote_fills(&mut managed.trade.open_legs, &result.quote);
                        self.finish_open(managed);
                    }
                    Err(e) => self.handle_rfq_failure(managed, e).await?,
                }
            }
            TradeMode::Unresolved => unreachable!("route() never returns Unresolved"),
        }
        Ok(())
    }

    async fn handle_rfq_failure(&self, managed: &mut ManagedTrade, error: CoreError) -> CoreResult<()> {
        if let Some(fallback) = managed.trade.metadata.get("fallback_mode").cloned() {
            managed.trade.mode = match fallback.as_str() {
                "limit" => TradeMode::Limit,
                "smart" => TradeMode::Smart,
                _ => {
                    managed.trade.fail(error.to_string());
                    return Ok(());
                }
            };
            tracing::warn!(trade_id = %managed.trade.id, fallback, "rfq open failed, falling back");
            Box::pin(self.dispatch_open_for_mode(managed)).await
        } else {
            managed.trade.fail(error.to_string());
            Ok(())
        }
    }

    fn finish_open(&self, managed: &mut ManagedTrade) {
        let any_filled = managed.trade.open_legs.iter().any(|l| l.filled_qty > rust_decimal::Decimal::ZERO);
        let all_filled = managed.trade.open_legs.iter().all(Leg::is_filled);

        if all_filled {
            let _ = managed.trade.transition(TradeState::Open);
        } else if any_filled {
            managed.trade.open_legs.retain_mut(|l| {
                let filled = l.filled_qty > rust_decimal::Decimal::ZERO;
                if filled {
                    l.qty = l.filled_qty;
                }
                filled
            });
            let _ = managed.trade.transition(TradeState::Open);
            let _ = managed.trade.transition(TradeState::PendingClose);
        } else {
            managed.trade.fail("no legs filled on open attempt");
        }
    }

    async fn check_open_progress(&self, managed: &mut ManagedTrade) -> CoreResult<()> {
        if managed.trade.mode != TradeMode::Limit {
            return Ok(());
        }
        let Some(mgr) = managed.fill_manager.as_mut() else {
            return Ok(());
        };
        let outcome = mgr
            .tick(&mut managed.trade.open_legs, self.transport.as_ref(), self.market_data.as_ref())
            .await?;
        match outcome {
            TickOutcome::Filled => {
                managed.trade.transition(TradeState::Open)?;
            }
            TickOutcome::Failed => {
                mgr.cancel_all(&managed.trade.open_legs, self.transport.as_ref()).await;
                self.finish_open(managed);
            }
            TickOutcome::Requoted | TickOutcome::Pending => {}
        }
        Ok(())
    }

    async fn evaluate_exits(&self, managed: &mut ManagedTrade, account: &AccountSnapshot) -> CoreResult<()> {
        for predicate in &managed.exit_predicates {
            let triggered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| predicate(account, &managed.trade)))
                .unwrap_or_else(|_| {
                    tracing::error!(trade_id = %managed.trade.id, "exit predicate panicked, skipping for this tick");
                    false
                });
            if triggered {
                managed.trade.transition(TradeState::PendingClose)?;
                break;
            }
        }
        Ok(())
    }

    async fn dispatch_close(&self, managed: &mut ManagedTrade) -> CoreResult<()> {
        managed.trade.sync_close_progress();
        managed.trade.rebuild_close_legs();
        if managed.trade.close_legs.is_empty() {
            managed.trade.transition(TradeState::Closing)?;
            managed.trade.transition(TradeState::Closed)?;
            return Ok(());
        }

        managed.trade.transition(TradeState::Closing)?;
        self.dispatch_close_for_mode(managed).await
    }

    /// Places orders for `managed.trade.close_legs` under whatever mode is
    /// currently set. Split out of [`Self::dispatch_close`] so an RFQ
    /// fallback can re-enter the same placement logic for its new mode, the
    /// same way [`Self::dispatch_open_for_mode`] does on the open side.
    async fn dispatch_close_for_mode(&self, managed: &mut ManagedTrade) -> CoreResult<()> {
        match managed.trade.mode {
            TradeMode::Limit => {
                let mut mgr = LimitFillManager::new(managed.trade.execution_params);
                match mgr
                    .place_all(&mut managed.trade.close_legs, self.transport.as_ref(), self.market_data.as_ref())
                    .await
                {
                    Ok(()) => managed.fill_manager = Some(mgr),
                    Err(_) => {
                        let _ = managed.trade.transition(TradeState::PendingClose);
                    }
                }
            }
            TradeMode::Smart => {
                let exec = SmartMultiLegExecutor::new(managed.trade.smart_exec_config.unwrap_or_default());
                exec.run(&mut managed.trade.close_legs, self.transport.as_ref(), self.market_data.as_ref())
                    .await?;
                self.finish_close(managed);
            }
            TradeMode::Rfq => {
                let rfq_action = match managed.trade.rfq_action {
                    crate::oms::types::RfqAction::Buy => crate::oms::types::RfqAction::Sell,
                    crate::oms::types::RfqAction::Sell => crate::oms::types::RfqAction::Buy,
                };
                match self
                    .rfq_executor
                    .run(&managed.trade.close_legs, rfq_action, self.transport.as_ref(), self.market_data.as_ref())
                    .await
                {
                    Ok(result) => {
                        apply_quote_fills(&mut managed.trade.close_legs, &result.quote);
                        self.finish_close(managed);
                    }
                    Err(e) => self.handle_rfq_close_failure(managed, e).await?,
                }
            }
            TradeMode::Unresolved => {
                let _ = managed.trade.transition(TradeState::PendingClose);
            }
        }
        Ok(())
    }

    /// Mirrors [`Self::handle_rfq_failure`] on the close side: the fallback
    /// mechanism (§4.2/§5) isn't specific to opens, so a close-side RFQ
    /// failure with `fallback_mode` set switches mode and re-dispatches
    /// instead of retrying RFQ indefinitely.
    async fn handle_rfq_close_failure(&self, managed: &mut ManagedTrade, error: CoreError) -> CoreResult<()> {
        if let Some(fallback) = managed.trade.metadata.get("fallback_mode").cloned() {
            match fallback.as_str() {
                "limit" => managed.trade.mode = TradeMode::Limit,
                "smart" => managed.trade.mode = TradeMode::Smart,
                _ => {
                    let _ = managed.trade.transition(TradeState::PendingClose);
                    return Ok(());
                }
            };
            tracing::warn!(trade_id = %managed.trade.id, fallback, "rfq close failed, falling back");
            Box::pin(self.dispatch_close_for_mode(managed)).await
        } else {
            tracing::warn!(trade_id = %managed.trade.id, error = %error, "rfq close failed, retrying via pending close");
            let _ = managed.trade.transition(TradeState::PendingClose);
            Ok(())
        }
    }

    fn finish_close(&self, managed: &mut ManagedTrade) {
        if managed.trade.close_legs.iter().all(Leg::is_filled) {
            let _ = managed.trade.transition(TradeState::Closed);
        } else {
            let _ = managed.trade.transition(TradeState::PendingClose);
        }
    }

    async fn check_close_progress(&self, managed: &mut ManagedTrade) -> CoreResult<()> {
        if managed.trade.mode != TradeMode::Limit {
            return Ok(());
        }
        let Some(mgr) = managed.fill_manager.as_mut() else {
            return Ok(());
        };
        let outcome = mgr
            .tick(&mut managed.trade.close_legs, self.transport.as_ref(), self.market_data.as_ref())
            .await?;
        match outcome {
            TickOutcome::Filled => managed.trade.transition(TradeState::Closed)?,
            TickOutcome::Failed => {
                mgr.cancel_all(&managed.trade.close_legs, self.transport.as_ref()).await;
                managed.trade.transition(TradeState::PendingClose)?;
            }
            TickOutcome::Requoted | TickOutcome::Pending => {}
        }
        Ok(())
    }

    pub async fn force_close(&self, id: &str) -> CoreResult<()> {
        let mut trades = self.trades.write().await;
        let managed = trades.get_mut(id).ok_or_else(|| CoreError::TradeNotFound(id.to_string()))?;
        match managed.trade.state {
            TradeState::Open => managed.trade.transition(TradeState::PendingClose),
            TradeState::Opening | TradeState::PendingOpen => {
                if let Some(mgr) = managed.fill_manager.as_ref() {
                    mgr.cancel_all(&managed.trade.open_legs, self.transport.as_ref()).await;
                }
                self.finish_open(managed);
                Ok(())
            }
            TradeState::Closing => {
                if let Some(mgr) = managed.fill_manager.as_ref() {
                    mgr.cancel_all(&managed.trade.close_legs, self.transport.as_ref()).await;
                }
                managed.trade.transition(TradeState::PendingClose)
            }
            TradeState::PendingClose | TradeState::Closed | TradeState::Failed => Ok(()),
        }
    }

    pub async fn cancel(&self, id: &str) -> CoreResult<()> {
        let mut trades = self.trades.write().await;
        let managed = trades.get_mut(id).ok_or_else(|| CoreError::TradeNotFound(id.to_string()))?;
        if !matches!(managed.trade.state, TradeState::PendingOpen | TradeState::Opening) {
            return Err(CoreError::IllegalTransition {
                from: format!("{:?}", managed.trade.state),
                action: "cancel",
            });
        }
        if let Some(mgr) = managed.fill_manager.as_ref() {
            mgr.cancel_all(&managed.trade.open_legs, self.transport.as_ref()).await;
        }
        let any_filled = managed.trade.open_legs.iter().any(|l| l.filled_qty > rust_decimal::Decimal::ZERO);
        if any_filled {
            self.finish_open(managed);
        } else {
            managed.trade.fail("cancelled with no fills");
        }
        Ok(())
    }
}

/// Apply an accepted RFQ quote's leg prices to the corresponding legs as a
/// full fill — a block trade either fills entirely or the quote is never
/// accepted.
fn apply_quote_fills(legs: &mut [Leg], quote: &crate::oms::types::Quote) {
    for leg in legs.iter_mut() {
        if let Some(quote_leg) = quote.legs.iter().find(|q| q.qty == leg.qty && q.side == leg.side.reversed()) {
            leg.filled_qty = leg.qty;
            leg.avg_fill_price = quote_leg.price;
        }
    }
}
