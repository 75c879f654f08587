use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Value stamped into `_sync_source` on every event produced by polling.
pub const SYNC_SOURCE: &str = "data_sync";

pub const KEY_SYNC_SOURCE: &str = "_sync_source";
pub const KEY_SOURCE_TABLE: &str = "_source_table";
pub const KEY_SOURCE_ID: &str = "_source_id";
pub const KEY_BACKFILL: &str = "_backfill";

/// Current payload schema version.
pub const EVENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "category.created")]
    CategoryCreated,
    #[serde(rename = "category.updated")]
    CategoryUpdated,
    #[serde(rename = "user.registered")]
    UserRegistered,
    #[serde(rename = "user.logged_in")]
    UserLoggedIn,
    #[serde(rename = "user.contact_field_changed")]
    ContactFieldChanged,
    #[serde(rename = "provider.registered")]
    ProviderRegistered,
    #[serde(rename = "provider.updated")]
    ProviderUpdated,
    #[serde(rename = "transaction.initiated")]
    TransactionInitiated,
    #[serde(rename = "transaction.completed")]
    TransactionCompleted,
    #[serde(rename = "transaction.failed")]
    TransactionFailed,
    #[serde(rename = "transaction.cancelled")]
    TransactionCancelled,
    #[serde(rename = "booking.created")]
    BookingCreated,
    #[serde(rename = "booking.updated")]
    BookingUpdated,
    #[serde(rename = "booking.completed")]
    BookingCompleted,
    #[serde(rename = "booking.cancelled")]
    BookingCancelled,
    #[serde(rename = "message.created")]
    MessageCreated,
    #[serde(rename = "rating.submitted")]
    RatingSubmitted,
    #[serde(rename = "dispute.opened")]
    DisputeOpened,
    #[serde(rename = "dispute.resolved")]
    DisputeResolved,
    #[serde(rename = "wallet.deposit")]
    WalletDeposit,
    #[serde(rename = "wallet.withdrawal")]
    WalletWithdrawal,
    #[serde(rename = "wallet.transfer")]
    WalletTransfer,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CategoryCreated => "category.created",
            Self::CategoryUpdated => "category.updated",
            Self::UserRegistered => "user.registered",
            Self::UserLoggedIn => "user.logged_in",
            Self::ContactFieldChanged => "user.contact_field_changed",
            Self::ProviderRegistered => "provider.registered",
            Self::ProviderUpdated => "provider.updated",
            Self::TransactionInitiated => "transaction.initiated",
            Self::TransactionCompleted => "transaction.completed",
            Self::TransactionFailed => "transaction.failed",
            Self::TransactionCancelled => "transaction.cancelled",
            Self::BookingCreated => "booking.created",
            Self::BookingUpdated => "booking.updated",
            Self::BookingCompleted => "booking.completed",
            Self::BookingCancelled => "booking.cancelled",
            Self::MessageCreated => "message.created",
            Self::RatingSubmitted => "rating.submitted",
            Self::DisputeOpened => "dispute.opened",
            Self::DisputeResolved => "dispute.resolved",
            Self::WalletDeposit => "wallet.deposit",
            Self::WalletWithdrawal => "wallet.withdrawal",
            Self::WalletTransfer => "wallet.transfer",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized, versioned record handed to the event bus.
///
/// Ownership passes to the bus on emission; nothing in this crate mutates an
/// event after `emit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// ULID (sortable by time).
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub correlation_id: String,
    /// Domain timestamp (the row's cursor value when available).
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub payload: Map<String, Value>,
}

impl DomainEvent {
    pub fn new(
        event_type: EventType,
        payload: Map<String, Value>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            event_type,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: timestamp.unwrap_or_else(Utc::now),
            version: EVENT_VERSION,
            payload,
        }
    }

    pub fn source_table(&self) -> Option<&str> {
        self.payload.get(KEY_SOURCE_TABLE).and_then(Value::as_str)
    }

    pub fn source_id(&self) -> Option<&str> {
        self.payload.get(KEY_SOURCE_ID).and_then(Value::as_str)
    }

    pub fn is_backfill(&self) -> bool {
        self.payload
            .get(KEY_BACKFILL)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Mark the event as part of a table's initial catch-up.
    pub fn into_backfill(mut self) -> Self {
        self.payload.insert(KEY_BACKFILL.to_string(), Value::Bool(true));
        self
    }

    /// Replay-suppression key: `table:source_id`, falling back to the event id.
    ///
    /// Contact-change events append the changed field and its new value, so
    /// they never shadow the primary event for the same row and a later change
    /// of the same field is not mistaken for a replay.
    pub fn dedup_key(&self, table: &str) -> String {
        let id = self.source_id().unwrap_or(&self.id);
        match (self.event_type, self.payload.get("field").and_then(Value::as_str)) {
            (EventType::ContactFieldChanged, Some(field)) => {
                let new_value = match self.payload.get("new_value") {
                    Some(Value::String(v)) => v.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                format!("{table}:{id}:{field}:{new_value}")
            }
            _ => format!("{table}:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Payload for `AlertSink::create_alert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub priority: AlertPriority,
    pub title: String,
    pub description: String,
    /// Component that raised the alert, e.g. "schema_drift_detector".
    pub source: String,
    pub auto_generated: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn system(
        priority: AlertPriority,
        source: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            priority,
            title: title.into(),
            description: description.into(),
            source: source.into(),
            auto_generated: true,
            metadata,
            created_at: Utc::now(),
        }
    }
}
