//! Strategy runner (§4.6): evaluates a declarative strategy configuration
//! on every account snapshot, opens trades when every entry gate passes,
//! and tracks close-callback delivery for the trades it owns.

use crate::account::AccountSnapshot;
use crate::oms::lifecycle::ExitPredicate;
use crate::oms::{LifecycleManager, RfqAction, Trade, TradeState};
use crate::strategy::predicates::EntryPredicate;
use crate::strategy::selection::{LegTemplate, OptionSelector};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

pub type OnTradeClosed = Arc<dyn Fn(&Trade) + Send + Sync>;

#[derive(Clone)]
pub struct StrategyConfig {
    pub strategy_id: String,
    pub check_interval_secs: i64,
    pub max_concurrent_trades: usize,
    pub cooldown_secs: i64,
    pub max_trades_per_day: usize,
    pub leg_templates: Vec<LegTemplate>,
    pub rfq_action: RfqAction,
    pub entry_predicates: Vec<EntryPredicate>,
    pub exit_predicates: Vec<ExitPredicate>,
}

#[derive(Debug, Clone, Default)]
pub struct StrategyStats {
    pub total_closed: u64,
    pub trades_today: u64,
    pub closed_pnl_today: rust_decimal::Decimal,
    pub avg_hold_duration_secs: f64,
}

struct RunnerState {
    enabled: bool,
    last_evaluated_at: Option<DateTime<Utc>>,
    seen_closed: HashSet<String>,
    stats: StrategyStats,
    hold_durations_secs: Vec<f64>,
}

/// One running instance per strategy configuration. Holds no ownership
/// over trades — the lifecycle manager owns those; the runner only reacts
/// to their state.
pub struct StrategyRunner {
    config: StrategyConfig,
    selector: Arc<dyn OptionSelector>,
    on_trade_closed: Option<OnTradeClosed>,
    state: Mutex<RunnerState>,
}

impl StrategyRunner {
    pub fn new(config: StrategyConfig, selector: Arc<dyn OptionSelector>, on_trade_closed: Option<OnTradeClosed>) -> Self {
        Self {
            config,
            selector,
            on_trade_closed,
            state: Mutex::new(RunnerState {
                enabled: true,
                last_evaluated_at: None,
                seen_closed: HashSet::new(),
                stats: StrategyStats::default(),
                hold_durations_secs: Vec::new(),
            }),
        }
    }

    pub async fn stats(&self) -> StrategyStats {
        self.state.lock().await.stats.clone()
    }

    /// One pass of the per-tick algorithm described in §4.6.
    pub async fn tick(&self, account: &AccountSnapshot, lifecycle: &LifecycleManager) {
        self.dispatch_close_callbacks(lifecycle).await;

        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }
        let now = Utc::now();
        if let Some(last) = state.last_evaluated_at {
            if (now - last).num_seconds() < self.config.check_interval_secs {
                return;
            }
        }
        state.last_evaluated_at = Some(now);
        drop(state);

        if !self.entry_gates_pass(account, lifecycle, now).await {
            return;
        }

        self.open_trade(lifecycle).await;
    }

    async fn dispatch_close_callbacks(&self, lifecycle: &LifecycleManager) {
        let trades = lifecycle.trades_for(&self.config.strategy_id).await;
        let mut state = self.state.lock().await;
        for trade in trades {
            if !matches!(trade.state, TradeState::Closed | TradeState::Failed) {
                continue;
            }
            if state.seen_closed.insert(trade.id.clone()) {
                state.stats.total_closed += 1;
                if let (Some(opened), Some(closed)) = (trade.opened_at, trade.closed_at) {
                    let secs = (closed - opened).num_seconds() as f64;
                    state.hold_durations_secs.push(secs);
                    let total: f64 = state.hold_durations_secs.iter().sum();
                    state.stats.avg_hold_duration_secs = total / state.hold_durations_secs.len() as f64;
                }
                if let Some(cb) = &self.on_trade_closed {
                    cb(&trade);
                }
            }
        }
    }

    async fn entry_gates_pass(&self, account: &AccountSnapshot, lifecycle: &LifecycleManager, now: DateTime<Utc>) -> bool {
        let active = lifecycle.active_trades_for(&self.config.strategy_id).await;
        if active.len() >= self.config.max_concurrent_trades {
            return false;
        }

        let all_trades = lifecycle.trades_for(&self.config.strategy_id).await;

        let cooldown_cutoff = now - ChronoDuration::seconds(self.config.cooldown_secs);
        if all_trades.iter().any(|t| t.created_at >= cooldown_cutoff) {
            return false;
        }

        let trades_today = all_trades
            .iter()
            .filter(|t| t.created_at.date_naive() == now.date_naive())
            .count();
        if trades_today >= self.config.max_trades_per_day {
            if active.is_empty() {
                let mut state = self.state.lock().await;
                state.enabled = false;
                tracing::info!(strategy_id = %self.config.strategy_id, "max trades per day reached with no active trades, disabling runner");
            }
            return false;
        }

        for predicate in &self.config.entry_predicates {
            let passed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| predicate(account))).unwrap_or(false);
            if !passed {
                return false;
            }
        }

        true
    }

    async fn open_trade(&self, lifecycle: &LifecycleManager) {
        let legs = match self.selector.resolve_all(&self.config.leg_templates).await {
            Ok(legs) => legs,
            Err(e) => {
                tracing::warn!(strategy_id = %self.config.strategy_id, error = %e, "leg template resolution failed, skipping entry");
                return;
            }
        };
        if legs.is_empty() {
            return;
        }

        let trade = Trade::new(self.config.strategy_id.clone(), legs, self.config.rfq_action);
        lifecycle.open(trade, self.config.exit_predicates.clone()).await;
    }
}

#[derive(Default)]
pub struct StrategyRunnerRegistry {
    runners: HashMap<String, Arc<StrategyRunner>>,
}

impl StrategyRunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: Arc<StrategyRunner>) {
        self.runners.insert(runner.config.strategy_id.clone(), runner);
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.runners.keys().cloned().collect()
    }

    pub async fn tick_all(&self, account: &AccountSnapshot, lifecycle: &LifecycleManager) {
        for runner in self.runners.values() {
            runner.tick(account, lifecycle).await;
        }
    }
}
