//! Account poller (§4.1): periodically fetches positions and account
//! summary from the venue, publishes an immutable snapshot, and notifies
//! registered listeners.
//!
//! Loop shape grounded on `src/commands/live.rs::run_async`'s
//! `tokio::select!` over a tick interval and a Ctrl+C-driven shutdown
//! channel, generalized from a strategy cycle to an account snapshot
//! publisher with listener callbacks instead of a single trader.

use crate::account::snapshot::{AccountSnapshot, PositionSnapshot};
use crate::error::{CoreError, CoreResult};
use crate::venue::{HttpMethod, VenueTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

pub type SnapshotListener = Arc<dyn Fn(AccountSnapshot) + Send + Sync>;

/// Polls the venue for account state on a fixed interval and fans it out
/// to registered listeners. Runs on a single task — no locking is needed
/// around the poll/publish sequence itself, only around the published
/// snapshot that other tasks read.
pub struct AccountPoller {
    transport: Arc<dyn VenueTransport>,
    poll_interval: Duration,
    latest: Arc<RwLock<Option<AccountSnapshot>>>,
    listeners: Arc<RwLock<Vec<SnapshotListener>>>,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl AccountPoller {
    pub fn new(transport: Arc<dyn VenueTransport>, poll_interval: Duration) -> Self {
        Self {
            transport,
            poll_interval,
            latest: Arc::new(RwLock::new(None)),
            listeners: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            worker: None,
        }
    }

    pub fn register_listener(&self, listener: SnapshotListener) {
        self.listeners.write().expect("listeners lock poisoned").push(listener);
    }

    pub fn latest(&self) -> Option<AccountSnapshot> {
        self.latest.read().expect("latest lock poisoned").clone()
    }

    /// Fetch and publish a snapshot immediately, outside the regular tick.
    pub async fn snapshot_now(&self) -> CoreResult<AccountSnapshot> {
        let snapshot = fetch_snapshot(self.transport.as_ref()).await?;
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    fn publish(&self, snapshot: AccountSnapshot) {
        *self.latest.write().expect("latest lock poisoned") = Some(snapshot.clone());
        for listener in self.listeners.read().expect("listeners lock poisoned").iter() {
            listener(snapshot.clone());
        }
    }

    /// Start the background polling worker. Joins within approximately one
    /// poll interval of `stop()` being called — in-flight HTTP calls are
    /// not cancelled mid-flight (§5).
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(tx);

        let transport = self.transport.clone();
        let latest = self.latest.clone();
        let listeners = self.listeners.clone();
        let running = self.running.clone();
        let mut tick = interval(self.poll_interval);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        match fetch_snapshot(transport.as_ref()).await {
                            Ok(snapshot) => {
                                *latest.write().expect("latest lock poisoned") = Some(snapshot.clone());
                                for listener in listeners.read().expect("listeners lock poisoned").iter() {
                                    listener(snapshot.clone());
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "account poll failed");
                            }
                        }
                    }
                    _ = rx.recv() => {
                        break;
                    }
                }
            }
        });

        self.worker = Some(handle);
    }

    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.await;
        }
    }
}

async fn fetch_snapshot(transport: &dyn VenueTransport) -> CoreResult<AccountSnapshot> {
    let positions_resp = transport
        .request(HttpMethod::Get, "/positions", None, None)
        .await?;
    if !positions_resp.is_success() {
        return Err(CoreError::Transport(format!(
            "positions fetch rejected: {}",
            positions_resp.msg
        )));
    }

    let summary_resp = transport
        .request(HttpMethod::Get, "/account/summary", None, None)
        .await?;
    if !summary_resp.is_success() {
        return Err(CoreError::Transport(format!(
            "account summary fetch rejected: {}",
            summary_resp.msg
        )));
    }

    let wire_positions: Vec<WirePosition> = serde_json::from_value(positions_resp.data)
        .map_err(|e| CoreError::Transport(format!("parse positions: {e}")))?;
    let taken_at = chrono::Utc::now();
    let positions = wire_positions
        .into_iter()
        .map(|p| PositionSnapshot {
            position_id: p.position_id,
            symbol: crate::types::Symbol::new(p.symbol),
            qty: p.qty,
            side: p.side,
            entry_price: p.entry_price,
            mark_price: p.mark_price,
            unrealized_pnl: p.unrealized_pnl,
            roi: p.roi,
            greeks: p.greeks,
            taken_at,
        })
        .collect();

    #[derive(serde::Deserialize)]
    struct SummaryData {
        equity: rust_decimal::Decimal,
        #[serde(rename = "initialMargin")]
        initial_margin: rust_decimal::Decimal,
        #[serde(rename = "marginAvailable")]
        available_margin: rust_decimal::Decimal,
        #[serde(rename = "maintenanceMargin", default)]
        maintenance_margin: rust_decimal::Decimal,
        #[serde(rename = "unrealizedPnl", default)]
        unrealized_pnl: rust_decimal::Decimal,
    }
    let summary: SummaryData = serde_json::from_value(summary_resp.data)
        .map_err(|e| CoreError::Transport(format!("parse account summary: {e}")))?;

    Ok(AccountSnapshot {
        taken_at,
        equity: summary.equity,
        available_margin: summary.available_margin,
        initial_margin: summary.initial_margin,
        maintenance_margin: summary.maintenance_margin,
        unrealized_pnl: summary.unrealized_pnl,
        positions,
    })
}

#[derive(serde::Deserialize)]
struct WirePosition {
    #[serde(rename = "positionId")]
    position_id: String,
    symbol: String,
    qty: rust_decimal::Decimal,
    side: crate::types::Side,
    #[serde(rename = "entryPrice")]
    entry_price: rust_decimal::Decimal,
    #[serde(rename = "markPrice")]
    mark_price: rust_decimal::Decimal,
    #[serde(rename = "unrealizedPnl")]
    unrealized_pnl: rust_decimal::Decimal,
    roi: rust_decimal::Decimal,
    greeks: crate::types::Greeks,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::TransportResponse;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct StubTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VenueTransport for StubTransport {
        async fn request(
            &self,
            _method: HttpMethod,
            path: &str,
            _json_body: Option<serde_json::Value>,
            _form_body: Option<serde_json::Value>,
        ) -> CoreResult<TransportResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let data = if path.starts_with("/positions") {
                serde_json::json!([])
            } else {
                serde_json::json!({"equity": "1000", "initialMargin": "0", "marginAvailable": "1000"})
            };
            Ok(TransportResponse {
                code: 0,
                msg: String::new(),
                data,
            })
        }
    }

    #[tokio::test]
    async fn snapshot_now_publishes_and_returns() {
        let transport: Arc<dyn VenueTransport> = Arc::new(StubTransport {
            calls: AtomicUsize::new(0),
        });
        let poller = AccountPoller::new(transport, Duration::from_secs(5));
        let snapshot = poller.snapshot_now().await.unwrap();
        assert_eq!(snapshot.equity, rust_decimal::Decimal::new(1000, 0));
        assert_eq!(poller.latest().unwrap().equity, snapshot.equity);
    }
}
