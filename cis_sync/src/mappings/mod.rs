//! Mapping Registry: static per-table configuration for the marketplace tables.

pub mod models;
pub mod tables;

pub use models::{ProvisionKind, Row, TableMapping, WatchedField};

use crate::{Error, Result};

/// Validated, ordered set of table mappings.
#[derive(Debug, Clone)]
pub struct MappingRegistry {
    mappings: Vec<TableMapping>,
}

impl MappingRegistry {
    /// Build a registry, rejecting duplicate tables and projections that omit
    /// their cursor or primary-key column.
    pub fn new(mappings: Vec<TableMapping>) -> Result<Self> {
        for (i, m) in mappings.iter().enumerate() {
            m.validate()?;
            if mappings[..i].iter().any(|o| o.source_table == m.source_table) {
                return Err(Error::InvalidInput(format!(
                    "duplicate mapping for table '{}'",
                    m.source_table
                )));
            }
        }
        Ok(Self { mappings })
    }

    /// The ten marketplace tables.
    pub fn marketplace() -> Result<Self> {
        Self::new(tables::marketplace_tables())
    }

    pub fn get(&self, table: &str) -> Option<&TableMapping> {
        self.mappings.iter().find(|m| m.source_table == table)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableMapping> {
        self.mappings.iter()
    }

    pub fn tables(&self) -> Vec<&'static str> {
        self.mappings.iter().map(|m| m.source_table).collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use serde_json::{json, Value};

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn marketplace_registry_is_valid() {
        let reg = MappingRegistry::marketplace().unwrap();
        assert_eq!(reg.len(), 10);
        for m in reg.iter() {
            let cols = m.projection_columns();
            assert!(cols.contains(&m.cursor_column.to_string()), "{}", m.source_table);
            assert!(cols.contains(&m.primary_key_column.to_string()), "{}", m.source_table);
        }
        assert!(reg.get("users").unwrap().is_identity_bearing());
        assert!(!reg.get("payments").unwrap().is_identity_bearing());
    }

    #[test]
    fn rejects_projection_without_cursor() {
        let mut m = tables::marketplace_tables().remove(0);
        m.select_projection = "id, name";
        assert!(MappingRegistry::new(vec![m]).is_err());
    }

    #[test]
    fn rejects_duplicate_tables() {
        let m = tables::marketplace_tables().remove(0);
        assert!(MappingRegistry::new(vec![m.clone(), m]).is_err());
    }

    #[test]
    fn poll_query_shape() {
        let reg = MappingRegistry::marketplace().unwrap();
        let q = reg.get("payments").unwrap().poll_query();
        assert!(q.starts_with("SELECT id, user_id, booking_id"));
        assert!(q.contains(
            "FROM payments WHERE (created_at > $1 OR (created_at = $1 AND id > $3)) AND (deleted_at IS NULL)"
        ));
        assert!(q.ends_with("ORDER BY created_at ASC, id ASC LIMIT $2"));
    }

    #[test]
    fn payment_status_maps_to_transaction_events() {
        let reg = MappingRegistry::marketplace().unwrap();
        let m = reg.get("payments").unwrap();
        let cases = [
            ("paid", EventType::TransactionCompleted),
            ("FAILED", EventType::TransactionFailed),
            ("refunded", EventType::TransactionCancelled),
            ("", EventType::TransactionInitiated),
        ];
        for (status, expected) in cases {
            let r = row(json!({ "id": 1, "payment_status": status }));
            assert_eq!((m.event_type_of)(&r), expected, "{status}");
        }
    }

    #[test]
    fn provider_created_vs_updated() {
        let reg = MappingRegistry::marketplace().unwrap();
        let m = reg.get("users").unwrap();
        let fresh = row(json!({
            "id": 5, "user_type": "provider",
            "created_at": "2026-01-01 10:00:00", "updated_at": "2026-01-01 10:00:00.800",
        }));
        let later = row(json!({
            "id": 5, "user_type": "handyman",
            "created_at": "2026-01-01 10:00:00", "updated_at": "2026-01-03 09:00:00",
        }));
        let customer = row(json!({ "id": 6, "user_type": "customer" }));
        assert_eq!((m.event_type_of)(&fresh), EventType::ProviderRegistered);
        assert_eq!((m.event_type_of)(&later), EventType::ProviderUpdated);
        assert_eq!((m.event_type_of)(&customer), EventType::UserRegistered);
    }

    #[test]
    fn booking_extracts_both_parties() {
        let reg = MappingRegistry::marketplace().unwrap();
        let m = reg.get("bookings").unwrap();
        let r = row(json!({ "id": 9, "user_id": 100, "provider_id": 200, "status": "completed" }));
        assert_eq!((m.extract_primary_entity_id)(&r).as_deref(), Some("100"));
        let counterparty = m.extract_counterparty_id.unwrap();
        assert_eq!(counterparty(&r).as_deref(), Some("200"));
        let payload = (m.to_payload)(&r);
        assert_eq!(payload["client_id"], json!("100"));
        assert_eq!(payload["status"], json!("completed"));
    }

    #[test]
    fn wallet_activity_classification() {
        let reg = MappingRegistry::marketplace().unwrap();
        let m = reg.get("wallet_histories").unwrap();
        let r = row(json!({ "id": 1, "activity_type": "wallet_withdraw_request" }));
        assert_eq!((m.event_type_of)(&r), EventType::WalletWithdrawal);
        let r = row(json!({ "id": 1, "type": "transfer_out" }));
        assert_eq!((m.event_type_of)(&r), EventType::WalletTransfer);
    }
}
