use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Rolling-window replay suppression keyed by `table:source_id`.
///
/// Independent of the watermark: it catches rows re-read after a crash
/// between emit and watermark advance.
pub struct DedupWindow {
    window: Duration,
    seen: DashMap<String, DateTime<Utc>>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
        }
    }

    /// True when `key` was not admitted within the window. Admitting records
    /// the key at `now`.
    pub fn admit_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        if let Some(at) = self.seen.get(key) {
            if (now - *at).to_std().unwrap_or_default() < self.window {
                return false;
            }
        }
        self.seen.insert(key.to_string(), now);
        true
    }

    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Utc::now())
    }

    /// Undo an admission whose emit failed.
    pub fn forget(&self, key: &str) {
        self.seen.remove(key);
    }

    /// Forget every key under `prefix`, e.g. `"bookings:"` after a reset.
    pub fn forget_prefix(&self, prefix: &str) {
        self.seen.retain(|k, _| !k.starts_with(prefix));
    }

    /// Drop entries older than the window.
    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen
            .retain(|_, at| (now - *at).to_std().unwrap_or_default() < window);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&self) {
        self.seen.clear();
    }
}
