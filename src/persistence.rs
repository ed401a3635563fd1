//! Trade state persistence (§6): throttled JSON snapshots of active trades
//! for crash recovery and operational visibility.
//!
//! Writes are throttled to once per [`SAVE_INTERVAL`] and land atomically —
//! the snapshot is written to a sibling `.tmp` file and renamed into place,
//! so a reader never observes a half-written file.

use crate::error::CoreResult;
use crate::oms::Trade;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

const SAVE_INTERVAL_SECS: u64 = 60;

/// Everything needed to fully reconstruct an in-flight trade on restart
/// (§6): which execution path it resolved to, both leg sets with their
/// fill progress, and the timestamps that distinguish a still-open trade
/// from one mid-close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTrade {
    pub id: String,
    pub strategy_id: String,
    pub state: String,
    pub mode: String,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub open_legs: Vec<PersistedLeg>,
    pub close_legs: Vec<PersistedLeg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedLeg {
    pub symbol: String,
    pub qty: rust_decimal::Decimal,
    pub side: String,
    pub order_id: Option<String>,
    pub filled_qty: rust_decimal::Decimal,
    pub avg_fill_price: rust_decimal::Decimal,
    pub closed_qty: rust_decimal::Decimal,
}

impl From<&crate::oms::Leg> for PersistedLeg {
    fn from(leg: &crate::oms::Leg) -> Self {
        Self {
            symbol: leg.symbol.as_str().to_string(),
            qty: leg.qty,
            side: format!("{:?}", leg.side),
            order_id: leg.order_id.clone(),
            filled_qty: leg.filled_qty,
            avg_fill_price: leg.avg_fill_price,
            closed_qty: leg.closed_qty,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeStateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub trade_count: usize,
    pub trades: Vec<PersistedTrade>,
}

impl From<&Trade> for PersistedTrade {
    fn from(trade: &Trade) -> Self {
        Self {
            id: trade.id.clone(),
            strategy_id: trade.strategy_id.clone(),
            state: format!("{:?}", trade.state),
            mode: format!("{:?}", trade.mode),
            created_at: trade.created_at,
            opened_at: trade.opened_at,
            closed_at: trade.closed_at,
            error: trade.error.clone(),
            open_legs: trade.open_legs.iter().map(PersistedLeg::from).collect(),
            close_legs: trade.close_legs.iter().map(PersistedLeg::from).collect(),
        }
    }
}

/// Throttled, atomic JSON snapshot writer for active trade state.
pub struct TradeStatePersistence {
    state_file: PathBuf,
    last_save: Mutex<Option<Instant>>,
}

impl TradeStatePersistence {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            last_save: Mutex::new(None),
        }
    }

    /// Writes `trades` to disk if at least [`SAVE_INTERVAL_SECS`] has
    /// elapsed since the last successful write; otherwise a no-op.
    pub async fn maybe_write(&self, trades: &[Trade]) -> CoreResult<()> {
        {
            let mut last_save = self.last_save.lock().unwrap();
            let due = match *last_save {
                Some(last) => last.elapsed().as_secs() >= SAVE_INTERVAL_SECS,
                None => true,
            };
            if !due {
                return Ok(());
            }
            *last_save = Some(Instant::now());
        }
        self.write_now(trades).await
    }

    /// Writes `trades` immediately, bypassing the throttle.
    pub async fn write_now(&self, trades: &[Trade]) -> CoreResult<()> {
        let snapshot = TradeStateSnapshot {
            timestamp: Utc::now(),
            trade_count: trades.len(),
            trades: trades.iter().map(PersistedTrade::from).collect(),
        };
        let state_file = self.state_file.clone();
        tokio::task::spawn_blocking(move || write_atomic(&state_file, &snapshot))
            .await
            .map_err(|e| crate::error::CoreError::Persistence(std::io::Error::other(e)))??;
        tracing::debug!(trades = trades.len(), path = %self.state_file.display(), "saved trade state");
        Ok(())
    }

    /// Loads the last saved snapshot, or `None` if no state file exists yet.
    pub fn load(&self) -> CoreResult<Option<TradeStateSnapshot>> {
        if !self.state_file.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.state_file)?;
        let snapshot: TradeStateSnapshot = serde_json::from_str(&data)?;
        tracing::info!(trades = snapshot.trades.len(), path = %self.state_file.display(), "loaded trade state");
        Ok(Some(snapshot))
    }

    /// Removes the persisted state file, if any.
    pub fn clear(&self) -> CoreResult<()> {
        if self.state_file.exists() {
            std::fs::remove_file(&self.state_file)?;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, snapshot: &TradeStateSnapshot) -> CoreResult<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
