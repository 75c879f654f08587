//! SQLite-backed SyncStore.
//!
//! Single WAL-mode file holding watermarks, the run log, and the users and
//! categories provisioned from synced rows.
//!
//! Usage:
//! ```ignore
//! let store = SqliteSyncStore::new("./data/cis_sync.db").await?;
//! ```

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::models::{epoch, ts, LocalCategory, LocalUser, SyncRunRecord, Watermark, WatermarkAdvance};
use super::traits::SyncStore;
use crate::{Error, Result};

#[derive(Clone)]
pub struct SqliteSyncStore {
    pool: SqlitePool,
}

impl SqliteSyncStore {
    /// Open (or create) the store file, creating parent directories as needed.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::backend("sqlite_sync_store mkdir", e))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("sqlite_sync_store", e))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_sync_store", e))?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::backend("sqlite_sync_store", e))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<std::time::Duration>)
            .max_lifetime(None::<std::time::Duration>)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_sync_store", e))?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("sqlite_sync_store migration", e))?;
        Ok(Self { pool })
    }

    fn parse_ts(raw: &str, column: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::backend(format!("sqlite_sync_store {column}"), e))
    }

    fn opt_ts(raw: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>> {
        raw.map(|r| Self::parse_ts(&r, column)).transpose()
    }

    fn watermark_from_row(row: &SqliteRow) -> Result<Watermark> {
        let last_synced_at: String = row.try_get("last_synced_at")?;
        let last_run_at: Option<String> = row.try_get("last_run_at")?;
        Ok(Watermark {
            source_table: row.try_get("source_table")?,
            last_synced_at: Self::parse_ts(&last_synced_at, "last_synced_at")?,
            last_synced_id: row.try_get("last_synced_id")?,
            records_synced: row.try_get("records_synced")?,
            last_run_at: Self::opt_ts(last_run_at, "last_run_at")?,
            last_run_duration_ms: row.try_get("last_run_duration_ms")?,
            last_error: row.try_get("last_error")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
        })
    }

    fn run_from_row(row: &SqliteRow) -> Result<SyncRunRecord> {
        let started_at: String = row.try_get("started_at")?;
        let finished_at: String = row.try_get("finished_at")?;
        let before: String = row.try_get("watermark_before")?;
        let after: String = row.try_get("watermark_after")?;
        let row_errors: String = row.try_get("row_errors")?;
        Ok(SyncRunRecord {
            id: row.try_get("id")?,
            source_table: row.try_get("source_table")?,
            started_at: Self::parse_ts(&started_at, "started_at")?,
            finished_at: Self::parse_ts(&finished_at, "finished_at")?,
            records_found: row.try_get("records_found")?,
            records_processed: row.try_get("records_processed")?,
            records_failed: row.try_get("records_failed")?,
            events_emitted: row.try_get("events_emitted")?,
            error: row.try_get("error")?,
            row_errors: serde_json::from_str(&row_errors)
                .map_err(|e| Error::backend("sqlite_sync_store row_errors", e))?,
            watermark_before: Self::parse_ts(&before, "watermark_before")?,
            watermark_after: Self::parse_ts(&after, "watermark_after")?,
            duration_ms: row.try_get("duration_ms")?,
        })
    }

    fn user_from_row(row: &SqliteRow) -> Result<LocalUser> {
        let created_at: String = row.try_get("created_at")?;
        Ok(LocalUser {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            status: row.try_get("status")?,
            created_at: Self::parse_ts(&created_at, "created_at")?,
        })
    }

    fn category_from_row(row: &SqliteRow) -> Result<LocalCategory> {
        let updated_at: String = row.try_get("updated_at")?;
        Ok(LocalCategory {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            name: row.try_get("name")?,
            active: row.try_get::<i64, _>("active")? != 0,
            updated_at: Self::parse_ts(&updated_at, "updated_at")?,
        })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_watermarks (
    source_table TEXT PRIMARY KEY,
    last_synced_at TEXT NOT NULL,
    last_synced_id TEXT,
    records_synced INTEGER NOT NULL DEFAULT 0,
    last_run_at TEXT,
    last_run_duration_ms INTEGER,
    last_error TEXT,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS sync_run_log (
    id TEXT PRIMARY KEY,
    source_table TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    records_found INTEGER NOT NULL,
    records_processed INTEGER NOT NULL,
    records_failed INTEGER NOT NULL,
    events_emitted INTEGER NOT NULL,
    error TEXT,
    row_errors TEXT NOT NULL,
    watermark_before TEXT NOT NULL,
    watermark_after TEXT NOT NULL,
    duration_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS sync_run_log_started_idx ON sync_run_log(started_at);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    external_id TEXT NOT NULL UNIQUE,
    email TEXT,
    phone TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY,
    external_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    active INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

#[async_trait]
impl SyncStore for SqliteSyncStore {
    async fn register_table(&self, table: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_watermarks (source_table, last_synced_at, enabled) VALUES (?1, ?2, 1) \
             ON CONFLICT(source_table) DO NOTHING",
        )
        .bind(table)
        .bind(ts(epoch()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_watermark(&self, table: &str) -> Result<Option<Watermark>> {
        let row = sqlx::query("SELECT * FROM sync_watermarks WHERE source_table = ?1")
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::watermark_from_row).transpose()
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>> {
        let rows = sqlx::query("SELECT * FROM sync_watermarks ORDER BY source_table")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::watermark_from_row).collect()
    }

    async fn advance_watermark(&self, table: &str, advance: &WatermarkAdvance) -> Result<()> {
        // SET expressions all see the pre-update row.
        let res = sqlx::query(
            "UPDATE sync_watermarks SET \
               last_synced_id = CASE WHEN ?1 > last_synced_at \
                 OR (?1 = last_synced_at AND ?2 IS NOT NULL) THEN ?2 ELSE last_synced_id END, \
               last_synced_at = CASE WHEN ?1 > last_synced_at THEN ?1 ELSE last_synced_at END, \
               records_synced = records_synced + ?3, \
               last_run_at = ?4, \
               last_run_duration_ms = ?5, \
               last_error = ?6 \
             WHERE source_table = ?7",
        )
        .bind(ts(advance.last_synced_at))
        .bind(advance.last_synced_id.as_deref())
        .bind(advance.records_processed)
        .bind(ts(advance.run_at))
        .bind(advance.duration_ms)
        .bind(advance.error.as_deref())
        .bind(table)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("watermark for table '{table}'")));
        }
        Ok(())
    }

    async fn set_table_enabled(&self, table: &str, enabled: bool) -> Result<()> {
        let res = sqlx::query("UPDATE sync_watermarks SET enabled = ?1 WHERE source_table = ?2")
            .bind(enabled as i64)
            .bind(table)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("watermark for table '{table}'")));
        }
        Ok(())
    }

    async fn reset_watermark(&self, table: &str) -> Result<()> {
        let res = sqlx::query(
            "UPDATE sync_watermarks SET last_synced_at = ?1, last_synced_id = NULL, \
             records_synced = 0, last_error = NULL WHERE source_table = ?2",
        )
        .bind(ts(epoch()))
        .bind(table)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("watermark for table '{table}'")));
        }
        Ok(())
    }

    async fn append_run(&self, run: &SyncRunRecord) -> Result<()> {
        let row_errors = serde_json::to_string(&run.row_errors)
            .map_err(|e| Error::backend("sqlite_sync_store row_errors", e))?;
        sqlx::query(
            "INSERT INTO sync_run_log (id, source_table, started_at, finished_at, records_found, \
             records_processed, records_failed, events_emitted, error, row_errors, \
             watermark_before, watermark_after, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&run.id)
        .bind(&run.source_table)
        .bind(ts(run.started_at))
        .bind(ts(run.finished_at))
        .bind(run.records_found)
        .bind(run.records_processed)
        .bind(run.records_failed)
        .bind(run.events_emitted)
        .bind(run.error.as_deref())
        .bind(row_errors)
        .bind(ts(run.watermark_before))
        .bind(ts(run.watermark_after))
        .bind(run.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>> {
        let rows = sqlx::query("SELECT * FROM sync_run_log ORDER BY started_at DESC, id DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn runs_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncRunRecord>> {
        let rows = sqlx::query("SELECT * FROM sync_run_log WHERE started_at >= ?1 ORDER BY started_at ASC, id ASC")
            .bind(ts(since))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<LocalUser>> {
        let row = sqlx::query("SELECT * FROM users WHERE external_id = ?1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::user_from_row).transpose()
    }

    async fn insert_user_if_absent(&self, user: &LocalUser) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO users (id, external_id, email, phone, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT(external_id) DO NOTHING",
        )
        .bind(&user.id)
        .bind(&user.external_id)
        .bind(user.email.as_deref())
        .bind(user.phone.as_deref())
        .bind(&user.status)
        .bind(ts(user.created_at))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn update_user_contact(&self, external_id: &str, field: &str, value: Option<&str>) -> Result<()> {
        let sql = match field {
            "email" => "UPDATE users SET email = ?1 WHERE external_id = ?2",
            "phone" => "UPDATE users SET phone = ?1 WHERE external_id = ?2",
            other => return Err(Error::InvalidInput(format!("unknown contact field '{other}'"))),
        };
        sqlx::query(sql)
            .bind(value)
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_category(&self, category: &LocalCategory) -> Result<LocalCategory> {
        sqlx::query(
            "INSERT INTO categories (id, external_id, name, active, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(external_id) DO UPDATE SET name = excluded.name, \
             active = excluded.active, updated_at = excluded.updated_at",
        )
        .bind(&category.id)
        .bind(&category.external_id)
        .bind(&category.name)
        .bind(category.active as i64)
        .bind(ts(category.updated_at))
        .execute(&self.pool)
        .await?;
        self.find_category(&category.external_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("category '{}'", category.external_id)))
    }

    async fn find_category(&self, external_id: &str) -> Result<Option<LocalCategory>> {
        let row = sqlx::query("SELECT * FROM categories WHERE external_id = ?1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::category_from_row).transpose()
    }
}
