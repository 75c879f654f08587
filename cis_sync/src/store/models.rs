use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Lower bound every table starts from.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

/// Fixed-width RFC 3339 rendering; sorts lexicographically in chronological order.
pub fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Per-table sync progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    pub source_table: String,
    pub last_synced_at: DateTime<Utc>,
    pub last_synced_id: Option<String>,
    pub records_synced: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_duration_ms: Option<i64>,
    pub last_error: Option<String>,
    pub enabled: bool,
}

impl Watermark {
    pub fn new(source_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            last_synced_at: epoch(),
            last_synced_id: None,
            records_synced: 0,
            last_run_at: None,
            last_run_duration_ms: None,
            last_error: None,
            enabled: true,
        }
    }

    /// Never synced (or reset): the next poll is a backfill.
    pub fn is_at_epoch(&self) -> bool {
        self.last_synced_at <= epoch()
    }
}

/// Post-cycle watermark mutation. The cursor only moves forward.
#[derive(Debug, Clone)]
pub struct WatermarkAdvance {
    pub last_synced_at: DateTime<Utc>,
    pub last_synced_id: Option<String>,
    pub records_processed: i64,
    pub run_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// Append-only audit of one table poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunRecord {
    pub id: String,
    pub source_table: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_found: i64,
    pub records_processed: i64,
    pub records_failed: i64,
    pub events_emitted: i64,
    pub error: Option<String>,
    /// One entry per failed row, `"{source_id}: {message}"`.
    pub row_errors: Vec<String>,
    pub watermark_before: DateTime<Utc>,
    pub watermark_after: DateTime<Utc>,
    pub duration_ms: i64,
}

impl SyncRunRecord {
    pub fn start(source_table: impl Into<String>, started_at: DateTime<Utc>, watermark: DateTime<Utc>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            source_table: source_table.into(),
            started_at,
            finished_at: started_at,
            records_found: 0,
            records_processed: 0,
            records_failed: 0,
            events_emitted: 0,
            error: None,
            row_errors: Vec::new(),
            watermark_before: watermark,
            watermark_after: watermark,
            duration_ms: 0,
        }
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = finished_at;
        self.duration_ms = (finished_at - self.started_at).num_milliseconds().max(0);
    }

    pub fn watermark_moved(&self) -> bool {
        self.watermark_after != self.watermark_before
    }
}

/// Locally provisioned user mirrored from the external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: String,
    pub external_id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl LocalUser {
    /// Default-attribute user for an external id seen for the first time.
    pub fn placeholder(external_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            external_id: external_id.into(),
            email: None,
            phone: None,
            status: "active".to_string(),
            created_at: now,
        }
    }

    pub fn contact(&self, field: &str) -> Option<&str> {
        match field {
            "email" => self.email.as_deref(),
            "phone" => self.phone.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalCategory {
    pub id: String,
    pub external_id: String,
    pub name: String,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}
