//! Sync orchestration: the cycle loop, replay suppression and backoff.

pub mod backoff;
pub mod dedup;
pub mod engine;

pub use backoff::Backoff;
pub use dedup::DedupWindow;
pub use engine::{CycleReport, SyncMode, SyncService, SyncStatus, MAX_RUN_HISTORY};
