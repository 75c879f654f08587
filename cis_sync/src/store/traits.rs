use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{LocalCategory, LocalUser, SyncRunRecord, Watermark, WatermarkAdvance};
use crate::Result;

/// Local persisted state: watermarks, the run log and provisioned entities.
///
/// Never touches the external source.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Insert-or-ignore a table at the epoch watermark, enabled.
    async fn register_table(&self, table: &str) -> Result<()>;

    async fn get_watermark(&self, table: &str) -> Result<Option<Watermark>>;

    async fn list_watermarks(&self) -> Result<Vec<Watermark>>;

    /// Move the cursor forward (never back), add to `records_synced`, and
    /// refresh the last-run fields. At an unchanged cursor time a supplied id
    /// replaces the stored one, which resumes rows sharing that time.
    async fn advance_watermark(&self, table: &str, advance: &WatermarkAdvance) -> Result<()>;

    async fn set_table_enabled(&self, table: &str, enabled: bool) -> Result<()>;

    /// Back to epoch with counters cleared.
    async fn reset_watermark(&self, table: &str) -> Result<()>;

    async fn append_run(&self, run: &SyncRunRecord) -> Result<()>;

    /// Newest first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>>;

    /// Oldest first.
    async fn runs_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncRunRecord>>;

    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<LocalUser>>;

    /// Returns false when a user with the same external id already exists.
    async fn insert_user_if_absent(&self, user: &LocalUser) -> Result<bool>;

    /// `field` is `"email"` or `"phone"`.
    async fn update_user_contact(&self, external_id: &str, field: &str, value: Option<&str>) -> Result<()>;

    /// Insert or refresh name and status.
    async fn upsert_category(&self, category: &LocalCategory) -> Result<LocalCategory>;

    async fn find_category(&self, external_id: &str) -> Result<Option<LocalCategory>>;
}
