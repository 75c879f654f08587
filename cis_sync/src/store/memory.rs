use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::models::{epoch, LocalCategory, LocalUser, SyncRunRecord, Watermark, WatermarkAdvance};
use super::traits::SyncStore;
use crate::{Error, Result};

#[derive(Default)]
struct State {
    watermarks: BTreeMap<String, Watermark>,
    runs: Vec<SyncRunRecord>,
    users: HashMap<String, LocalUser>,
    categories: HashMap<String, LocalCategory>,
}

/// In-memory SyncStore for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemorySyncStore {
    state: Arc<Mutex<State>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(table: &str) -> Error {
    Error::NotFound(format!("watermark for table '{table}'"))
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn register_table(&self, table: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .watermarks
            .entry(table.to_string())
            .or_insert_with(|| Watermark::new(table));
        Ok(())
    }

    async fn get_watermark(&self, table: &str) -> Result<Option<Watermark>> {
        Ok(self.state.lock().await.watermarks.get(table).cloned())
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>> {
        Ok(self.state.lock().await.watermarks.values().cloned().collect())
    }

    async fn advance_watermark(&self, table: &str, advance: &WatermarkAdvance) -> Result<()> {
        let mut state = self.state.lock().await;
        let wm = state.watermarks.get_mut(table).ok_or_else(|| missing(table))?;
        if advance.last_synced_at > wm.last_synced_at {
            wm.last_synced_at = advance.last_synced_at;
            wm.last_synced_id = advance.last_synced_id.clone();
        } else if advance.last_synced_at == wm.last_synced_at && advance.last_synced_id.is_some() {
            wm.last_synced_id = advance.last_synced_id.clone();
        }
        wm.records_synced += advance.records_processed;
        wm.last_run_at = Some(advance.run_at);
        wm.last_run_duration_ms = Some(advance.duration_ms);
        wm.last_error = advance.error.clone();
        Ok(())
    }

    async fn set_table_enabled(&self, table: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let wm = state.watermarks.get_mut(table).ok_or_else(|| missing(table))?;
        wm.enabled = enabled;
        Ok(())
    }

    async fn reset_watermark(&self, table: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let wm = state.watermarks.get_mut(table).ok_or_else(|| missing(table))?;
        wm.last_synced_at = epoch();
        wm.last_synced_id = None;
        wm.records_synced = 0;
        wm.last_error = None;
        Ok(())
    }

    async fn append_run(&self, run: &SyncRunRecord) -> Result<()> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn runs_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncRunRecord>> {
        let state = self.state.lock().await;
        let mut runs: Vec<SyncRunRecord> = state
            .runs
            .iter()
            .filter(|r| r.started_at >= since)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<LocalUser>> {
        Ok(self.state.lock().await.users.get(external_id).cloned())
    }

    async fn insert_user_if_absent(&self, user: &LocalUser) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.users.contains_key(&user.external_id) {
            return Ok(false);
        }
        state.users.insert(user.external_id.clone(), user.clone());
        Ok(true)
    }

    async fn update_user_contact(&self, external_id: &str, field: &str, value: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(user) = state.users.get_mut(external_id) else {
            return Ok(());
        };
        let slot = match field {
            "email" => &mut user.email,
            "phone" => &mut user.phone,
            other => return Err(Error::InvalidInput(format!("unknown contact field '{other}'"))),
        };
        *slot = value.map(str::to_string);
        Ok(())
    }

    async fn upsert_category(&self, category: &LocalCategory) -> Result<LocalCategory> {
        let mut state = self.state.lock().await;
        let stored = state
            .categories
            .entry(category.external_id.clone())
            .and_modify(|c| {
                c.name = category.name.clone();
                c.active = category.active;
                c.updated_at = category.updated_at;
            })
            .or_insert_with(|| category.clone());
        Ok(stored.clone())
    }

    async fn find_category(&self, external_id: &str) -> Result<Option<LocalCategory>> {
        Ok(self.state.lock().await.categories.get(external_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn advance_never_moves_backwards() {
        let store = MemorySyncStore::new();
        store.register_table("bookings").await.unwrap();
        let t1 = Utc::now();
        for (at, n) in [(t1, 2), (t1 - Duration::minutes(5), 1)] {
            store
                .advance_watermark(
                    "bookings",
                    &WatermarkAdvance {
                        last_synced_at: at,
                        last_synced_id: None,
                        records_processed: n,
                        run_at: Utc::now(),
                        duration_ms: 1,
                        error: None,
                    },
                )
                .await
                .unwrap();
        }
        let wm = store.get_watermark("bookings").await.unwrap().unwrap();
        assert_eq!(wm.last_synced_at, t1);
        assert_eq!(wm.records_synced, 3);
    }

    #[tokio::test]
    async fn unknown_table_is_not_found() {
        let store = MemorySyncStore::new();
        assert!(matches!(
            store.set_table_enabled("ghost", false).await,
            Err(Error::NotFound(_))
        ));
    }
}
