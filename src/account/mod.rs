//! Account snapshots and the poller that produces them (§4.1, §3).

pub mod poller;
pub mod snapshot;

pub use poller::{AccountPoller, SnapshotListener};
pub use snapshot::{AccountSnapshot, PositionSnapshot};
