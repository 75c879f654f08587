//! Marketplace table definitions. Column names follow the source's Laravel schema.

use serde_json::{json, Map, Value};

use super::models::{
    row_f64, row_flag, row_iso, row_nonempty, row_str, row_timestamp, ProvisionKind, Row,
    TableMapping, WatchedField,
};
use crate::events::EventType;

fn obj(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

fn lower(row: &Row, col: &str) -> String {
    row_str(row, col).unwrap_or_default().to_ascii_lowercase()
}

/// Rows touched within a second of creation are treated as new.
fn created_just_now(row: &Row) -> bool {
    match (row_timestamp(row, "created_at"), row_timestamp(row, "updated_at")) {
        (Some(c), Some(u)) => (u - c).num_milliseconds() <= 1_000,
        _ => false,
    }
}

// ─── categories ─────────────────────────────────────────────

fn category_event(row: &Row) -> EventType {
    if created_just_now(row) {
        EventType::CategoryCreated
    } else {
        EventType::CategoryUpdated
    }
}

fn category_payload(row: &Row) -> Map<String, Value> {
    obj(json!({
        "category_id": row_str(row, "id"),
        "name": row_str(row, "name").unwrap_or_default(),
        "is_featured": row_flag(row, "is_featured"),
        "status": if row_flag(row, "status") { "active" } else { "inactive" },
    }))
}

fn no_entity(_: &Row) -> Option<String> {
    None
}

// ─── users ──────────────────────────────────────────────────

fn user_event(row: &Row) -> EventType {
    match lower(row, "user_type").as_str() {
        "provider" | "handyman" if created_just_now(row) => EventType::ProviderRegistered,
        "provider" | "handyman" => EventType::ProviderUpdated,
        _ => EventType::UserRegistered,
    }
}

fn user_payload(row: &Row) -> Map<String, Value> {
    obj(json!({
        "user_id": row_str(row, "id"),
        "external_id": row_str(row, "id"),
        "email": row_nonempty(row, "email"),
        "phone": row_nonempty(row, "phone_number"),
        "user_type": row_nonempty(row, "user_type").unwrap_or_else(|| "customer".to_string()),
        "metadata": {
            "first_name": row_nonempty(row, "first_name"),
            "last_name": row_nonempty(row, "last_name"),
            "is_email_verified": row_flag(row, "is_email_verified"),
            "is_phone_verified": row_flag(row, "is_phone_verified"),
            "is_kyc_verified": row_flag(row, "is_kyc_verified"),
            "wallet_balance": row_f64(row, "wallet_balance"),
        },
    }))
}

fn user_id(row: &Row) -> Option<String> {
    row_nonempty(row, "id")
}

const USER_WATCHED: &[WatchedField] = &[
    WatchedField {
        field: "email",
        column: "email",
    },
    WatchedField {
        field: "phone",
        column: "phone_number",
    },
];

// ─── payments ───────────────────────────────────────────────

fn payment_event(row: &Row) -> EventType {
    match lower(row, "payment_status").as_str() {
        "paid" | "completed" | "success" => EventType::TransactionCompleted,
        "failed" | "rejected" => EventType::TransactionFailed,
        "cancelled" | "refunded" => EventType::TransactionCancelled,
        _ => EventType::TransactionInitiated,
    }
}

fn payment_payload(row: &Row) -> Map<String, Value> {
    obj(json!({
        "transaction_id": row_str(row, "id"),
        "user_id": row_str(row, "user_id"),
        "booking_id": row_nonempty(row, "booking_id"),
        "amount": row_f64(row, "total_amount"),
        "currency": "USD",
        "payment_method": row_nonempty(row, "payment_type").unwrap_or_else(|| "unknown".to_string()),
        "txn_id": row_nonempty(row, "txn_id"),
        "transaction_fee": row_f64(row, "transaction_fee"),
        "status": row_nonempty(row, "payment_status").unwrap_or_else(|| "pending".to_string()),
        "refund_id": row_nonempty(row, "refund_id"),
        "refund_amount": row_f64(row, "refund_amount"),
    }))
}

fn payer_id(row: &Row) -> Option<String> {
    row_nonempty(row, "user_id")
}

// ─── bookings ───────────────────────────────────────────────

fn booking_event(row: &Row) -> EventType {
    match lower(row, "status").as_str() {
        "cancelled" | "rejected" | "failed" => EventType::BookingCancelled,
        "completed" => EventType::BookingCompleted,
        "accept" | "on_going" | "in_progress" => EventType::BookingUpdated,
        _ => EventType::BookingCreated,
    }
}

fn booking_payload(row: &Row) -> Map<String, Value> {
    obj(json!({
        "booking_id": row_str(row, "id"),
        "booking_uid": row_nonempty(row, "booking_uid"),
        "client_id": row_str(row, "user_id"),
        "provider_id": row_nonempty(row, "provider_id"),
        "service_id": row_nonempty(row, "service_id"),
        "category_id": row_nonempty(row, "category_id"),
        "amount": row_f64(row, "total_amount"),
        "currency": "USD",
        "status": row_nonempty(row, "status").unwrap_or_else(|| "pending".to_string()),
        "scheduled_at": row_iso(row, "date"),
        "completed_at": row_iso(row, "completed_at"),
        "cancelled_at": row_iso(row, "cancelled_at"),
    }))
}

fn booking_client(row: &Row) -> Option<String> {
    row_nonempty(row, "user_id")
}

fn booking_provider(row: &Row) -> Option<String> {
    row_nonempty(row, "provider_id")
}

// ─── notifications ──────────────────────────────────────────

fn notification_event(_: &Row) -> EventType {
    EventType::MessageCreated
}

fn notification_payload(row: &Row) -> Map<String, Value> {
    obj(json!({
        "message_id": row_str(row, "id"),
        "receiver_id": row_str(row, "notifiable_id"),
        "sender_id": "system",
        "notification_type": row_str(row, "type").unwrap_or_default(),
        "message_type": "notification",
        "read_at": row_str(row, "read_at"),
        "data": row_str(row, "data").unwrap_or_else(|| "{}".to_string()),
    }))
}

fn notifiable_id(row: &Row) -> Option<String> {
    row_nonempty(row, "notifiable_id")
}

// ─── ratings ────────────────────────────────────────────────

fn rating_event(_: &Row) -> EventType {
    EventType::RatingSubmitted
}

fn rating_payload(row: &Row) -> Map<String, Value> {
    let score = match row.get("rating") {
        Some(Value::Null) | None => 5,
        _ => row_f64(row, "rating") as i64,
    };
    obj(json!({
        "rating_id": row_str(row, "id"),
        "client_id": row_str(row, "customer_id"),
        "provider_id": row_str(row, "provider_id"),
        "booking_id": row_nonempty(row, "booking_id"),
        "score": score,
        "comment": row_nonempty(row, "review"),
        "status": if row_flag(row, "status") { "active" } else { "hidden" },
    }))
}

fn rating_customer(row: &Row) -> Option<String> {
    row_nonempty(row, "customer_id")
}

fn rating_provider(row: &Row) -> Option<String> {
    row_nonempty(row, "provider_id")
}

// ─── suspicious_activities ──────────────────────────────────

fn dispute_event(row: &Row) -> EventType {
    match lower(row, "status").as_str() {
        "resolved" | "dismissed" | "cleared" => EventType::DisputeResolved,
        _ => EventType::DisputeOpened,
    }
}

fn dispute_payload(row: &Row) -> Map<String, Value> {
    obj(json!({
        "dispute_id": row_str(row, "id"),
        "complainant_id": "system",
        "respondent_id": row_str(row, "user_id"),
        "device_id": row_nonempty(row, "device_id"),
        "reason": row_str(row, "description").unwrap_or_default(),
        "status": row_nonempty(row, "status").unwrap_or_else(|| "pending".to_string()),
        "admin_notes": row_nonempty(row, "admin_notes"),
    }))
}

fn reported_user(row: &Row) -> Option<String> {
    row_nonempty(row, "user_id")
}

// ─── booking_activities ─────────────────────────────────────

fn booking_activity_event(_: &Row) -> EventType {
    EventType::BookingUpdated
}

fn booking_activity_payload(row: &Row) -> Map<String, Value> {
    obj(json!({
        "activity_id": row_str(row, "id"),
        "booking_id": row_nonempty(row, "booking_id"),
        "activity_type": row_nonempty(row, "activity_type").unwrap_or_else(|| "status_change".to_string()),
        "activity_message": row_str(row, "activity_message").unwrap_or_default(),
        "datetime": row_str(row, "datetime"),
    }))
}

// ─── wallet_histories ───────────────────────────────────────

fn wallet_event(row: &Row) -> EventType {
    let kind = row_nonempty(row, "activity_type")
        .or_else(|| row_nonempty(row, "type"))
        .unwrap_or_default()
        .to_ascii_lowercase();
    if kind.contains("deposit") || kind.contains("credit") {
        EventType::WalletDeposit
    } else if kind.contains("withdraw") || kind.contains("debit") {
        EventType::WalletWithdrawal
    } else if kind.contains("transfer") {
        EventType::WalletTransfer
    } else {
        EventType::WalletDeposit
    }
}

fn wallet_payload(row: &Row) -> Map<String, Value> {
    obj(json!({
        "wallet_tx_id": row_str(row, "id"),
        "user_id": row_str(row, "user_id"),
        "sender_id": row_nonempty(row, "sender_id"),
        "receiver_id": row_nonempty(row, "receiver_id"),
        "tx_type": row_nonempty(row, "activity_type")
            .or_else(|| row_nonempty(row, "type"))
            .unwrap_or_else(|| "unknown".to_string()),
        "amount": row_f64(row, "amount"),
        "balance": row_f64(row, "balance"),
        "currency": "USD",
        "status": "completed",
    }))
}

fn wallet_owner(row: &Row) -> Option<String> {
    row_nonempty(row, "user_id")
}

fn wallet_receiver(row: &Row) -> Option<String> {
    row_nonempty(row, "receiver_id")
}

// ─── login_activities ───────────────────────────────────────

fn login_event(_: &Row) -> EventType {
    EventType::UserLoggedIn
}

fn login_payload(row: &Row) -> Map<String, Value> {
    obj(json!({
        "login_id": row_str(row, "id"),
        "user_id": row_str(row, "user_id"),
        "ip_address": row_nonempty(row, "ip_address"),
        "device_type": row_nonempty(row, "device_type"),
        "browser": row_nonempty(row, "browser"),
        "location": row_nonempty(row, "location"),
    }))
}

fn login_user(row: &Row) -> Option<String> {
    row_nonempty(row, "user_id")
}

/// All marketplace tables, in sync order.
pub fn marketplace_tables() -> Vec<TableMapping> {
    vec![
        TableMapping {
            source_table: "categories",
            cursor_column: "updated_at",
            primary_key_column: "id",
            select_projection: "id, name, description, is_featured, status, created_at, updated_at",
            event_type_of: category_event,
            to_payload: category_payload,
            extract_primary_entity_id: no_entity,
            extract_counterparty_id: None,
            extra_filter: Some("status = 1"),
            provision: ProvisionKind::Category,
            watched_fields: &[],
        },
        TableMapping {
            source_table: "users",
            cursor_column: "updated_at",
            primary_key_column: "id",
            select_projection: "id, first_name, last_name, email, user_type, phone_number, \
                is_active, is_email_verified, is_phone_verified, is_kyc_verified, \
                wallet_balance, created_at, updated_at",
            event_type_of: user_event,
            to_payload: user_payload,
            extract_primary_entity_id: user_id,
            extract_counterparty_id: None,
            extra_filter: Some("is_active = 1 AND deleted_at IS NULL"),
            provision: ProvisionKind::Users,
            watched_fields: USER_WATCHED,
        },
        TableMapping {
            source_table: "payments",
            cursor_column: "created_at",
            primary_key_column: "id",
            select_projection: "id, user_id, booking_id, total_amount, payment_type, txn_id, \
                payment_status, transaction_fee, refund_id, refund_amount, created_at, updated_at",
            event_type_of: payment_event,
            to_payload: payment_payload,
            extract_primary_entity_id: payer_id,
            extract_counterparty_id: None,
            extra_filter: Some("deleted_at IS NULL"),
            provision: ProvisionKind::Users,
            watched_fields: &[],
        },
        TableMapping {
            source_table: "bookings",
            cursor_column: "updated_at",
            primary_key_column: "id",
            select_projection: "id, booking_uid, user_id, provider_id, service_id, category_id, \
                status, total_amount, date, completed_at, cancelled_at, created_at, updated_at",
            event_type_of: booking_event,
            to_payload: booking_payload,
            extract_primary_entity_id: booking_client,
            extract_counterparty_id: Some(booking_provider),
            extra_filter: None,
            provision: ProvisionKind::Users,
            watched_fields: &[],
        },
        TableMapping {
            source_table: "notifications",
            cursor_column: "created_at",
            primary_key_column: "id",
            select_projection: "id, type, notifiable_type, notifiable_id, data, read_at, \
                created_at, updated_at",
            event_type_of: notification_event,
            to_payload: notification_payload,
            extract_primary_entity_id: notifiable_id,
            extract_counterparty_id: None,
            extra_filter: None,
            provision: ProvisionKind::Users,
            watched_fields: &[],
        },
        TableMapping {
            source_table: "ratings",
            cursor_column: "created_at",
            primary_key_column: "id",
            select_projection: "id, booking_id, provider_id, customer_id, rating, review, status, \
                created_at, updated_at",
            event_type_of: rating_event,
            to_payload: rating_payload,
            extract_primary_entity_id: rating_customer,
            extract_counterparty_id: Some(rating_provider),
            extra_filter: None,
            provision: ProvisionKind::Users,
            watched_fields: &[],
        },
        TableMapping {
            source_table: "suspicious_activities",
            cursor_column: "updated_at",
            primary_key_column: "id",
            select_projection: "id, user_id, device_id, description, status, admin_notes, \
                created_at, updated_at",
            event_type_of: dispute_event,
            to_payload: dispute_payload,
            extract_primary_entity_id: reported_user,
            extract_counterparty_id: None,
            extra_filter: None,
            provision: ProvisionKind::Users,
            watched_fields: &[],
        },
        TableMapping {
            source_table: "booking_activities",
            cursor_column: "created_at",
            primary_key_column: "id",
            select_projection: "id, booking_id, datetime, activity_type, activity_message, \
                created_at, updated_at",
            event_type_of: booking_activity_event,
            to_payload: booking_activity_payload,
            extract_primary_entity_id: no_entity,
            extract_counterparty_id: None,
            extra_filter: Some("deleted_at IS NULL"),
            provision: ProvisionKind::None,
            watched_fields: &[],
        },
        TableMapping {
            source_table: "wallet_histories",
            cursor_column: "created_at",
            primary_key_column: "id",
            select_projection: "id, user_id, transaction_id, sender_id, receiver_id, type, amount, \
                balance, activity_type, activity_message, created_at, updated_at",
            event_type_of: wallet_event,
            to_payload: wallet_payload,
            extract_primary_entity_id: wallet_owner,
            extract_counterparty_id: Some(wallet_receiver),
            extra_filter: None,
            provision: ProvisionKind::Users,
            watched_fields: &[],
        },
        TableMapping {
            source_table: "login_activities",
            cursor_column: "created_at",
            primary_key_column: "id",
            select_projection: "id, user_id, ip_address, device_type, browser, location, \
                created_at, updated_at",
            event_type_of: login_event,
            to_payload: login_payload,
            extract_primary_entity_id: login_user,
            extract_counterparty_id: None,
            extra_filter: None,
            provision: ProvisionKind::Users,
            watched_fields: &[],
        },
    ]
}
