//! Row -> DomainEvent conversion and lazy provisioning of the local entities a
//! row references.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::events::models::{KEY_SOURCE_ID, KEY_SOURCE_TABLE, KEY_SYNC_SOURCE, SYNC_SOURCE};
use crate::events::{DomainEvent, EventType};
use crate::mappings::models::{row_flag, row_nonempty, row_str};
use crate::mappings::{ProvisionKind, Row, TableMapping};
use crate::store::{LocalCategory, LocalUser, SyncStore};
use crate::{Error, Result};

/// Payload fields that carry external user ids.
pub const USER_ID_FIELDS: &[&str] = &[
    "user_id",
    "client_id",
    "provider_id",
    "sender_id",
    "receiver_id",
    "respondent_id",
    "complainant_id",
    "customer_id",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedEntity {
    pub local_id: String,
    /// True when this call created the entity.
    pub created: bool,
}

/// External -> local id map for the entities one row references.
#[derive(Debug, Clone, Default)]
pub struct RowEntities {
    pub ids: HashMap<String, String>,
    pub created: HashSet<String>,
}

impl RowEntities {
    pub fn is_new(&self, external_id: &str) -> bool {
        self.created.contains(external_id)
    }
}

fn with_provenance(mut payload: Map<String, Value>, mapping: &TableMapping, source_id: &str) -> Map<String, Value> {
    payload.insert(KEY_SYNC_SOURCE.to_string(), Value::from(SYNC_SOURCE));
    payload.insert(KEY_SOURCE_TABLE.to_string(), Value::from(mapping.source_table));
    payload.insert(KEY_SOURCE_ID.to_string(), Value::from(source_id));
    payload
}

/// Build the row's event. Pure apart from the generated ids; the timestamp is
/// the cursor value, or now when the row has none.
pub fn transform_row(row: &Row, mapping: &TableMapping) -> Result<DomainEvent> {
    let source_id = mapping.source_id(row).ok_or_else(|| {
        Error::InvalidInput(format!(
            "{} row has no '{}' value",
            mapping.source_table, mapping.primary_key_column
        ))
    })?;
    let event_type = (mapping.event_type_of)(row);
    let payload = with_provenance((mapping.to_payload)(row), mapping, &source_id);
    Ok(DomainEvent::new(event_type, payload, mapping.cursor_value(row)))
}

/// Rewrite known user-reference fields from external to local ids. Fields
/// with no entry in `ids` are left untouched.
pub fn resolve_payload_user_ids(payload: &mut Map<String, Value>, ids: &HashMap<String, String>) {
    for field in USER_ID_FIELDS {
        let Some(external) = payload.get(*field).and_then(Value::as_str) else {
            continue;
        };
        if let Some(local) = ids.get(external) {
            payload.insert(field.to_string(), Value::from(local.clone()));
        }
    }
}

pub struct Transformer {
    store: Arc<dyn SyncStore>,
}

impl Transformer {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Resolve an external user id to its local id, creating a default user
    /// on first sight. Concurrent callers converge on whichever insert won.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn ensure_entity_exists(&self, external_id: &str) -> Result<ProvisionedEntity> {
        if let Some(u) = self.store.find_user_by_external_id(external_id).await? {
            return Ok(ProvisionedEntity {
                local_id: u.id,
                created: false,
            });
        }

        let candidate = LocalUser::placeholder(external_id, Utc::now());
        let inserted = self.store.insert_user_if_absent(&candidate).await?;
        let winner = self
            .store
            .find_user_by_external_id(external_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user with external id '{external_id}'")))?;
        if inserted {
            tracing::debug!(external_id, local_id = %winner.id, "provisioned local user");
        }
        Ok(ProvisionedEntity {
            created: inserted && winner.id == candidate.id,
            local_id: winner.id,
        })
    }

    /// Provision whatever the row references: its users, or the category the
    /// row itself describes.
    pub async fn ensure_entities_for_row(&self, row: &Row, mapping: &TableMapping) -> Result<RowEntities> {
        let mut out = RowEntities::default();
        match mapping.provision {
            ProvisionKind::None => {}
            ProvisionKind::Category => {
                if let Some(external_id) = mapping.source_id(row) {
                    let category = LocalCategory {
                        id: uuid::Uuid::new_v4().to_string(),
                        external_id: external_id.clone(),
                        name: row_str(row, "name").unwrap_or_default(),
                        active: row_flag(row, "status"),
                        updated_at: Utc::now(),
                    };
                    let stored = self.store.upsert_category(&category).await?;
                    out.ids.insert(external_id, stored.id);
                }
            }
            ProvisionKind::Users => {
                let referenced = [
                    Some((mapping.extract_primary_entity_id)(row)),
                    mapping.extract_counterparty_id.map(|f| f(row)),
                ];
                for external_id in referenced.into_iter().flatten().flatten() {
                    if out.ids.contains_key(&external_id) {
                        continue;
                    }
                    let entity = self.ensure_entity_exists(&external_id).await?;
                    if entity.created {
                        out.created.insert(external_id.clone());
                    }
                    out.ids.insert(external_id, entity.local_id);
                }
            }
        }
        Ok(out)
    }

    /// Compare watched contact fields against the stored values and emit one
    /// change event per difference, persisting the new value.
    ///
    /// Only identity-bearing tables are inspected. A brand-new entity, or a
    /// field with no stored value yet, is seeded without an event.
    pub async fn detect_field_changes(
        &self,
        row: &Row,
        mapping: &TableMapping,
        entities: &RowEntities,
    ) -> Result<Vec<DomainEvent>> {
        if !mapping.is_identity_bearing() {
            return Ok(Vec::new());
        }
        let Some(external_id) = (mapping.extract_primary_entity_id)(row) else {
            return Ok(Vec::new());
        };
        let Some(user) = self.store.find_user_by_external_id(&external_id).await? else {
            return Ok(Vec::new());
        };
        let is_new = entities.is_new(&external_id);
        let source_id = mapping.source_id(row).unwrap_or_else(|| external_id.clone());
        let timestamp = mapping.cursor_value(row);

        let mut events = Vec::new();
        for watched in mapping.watched_fields {
            let Some(incoming) = row_nonempty(row, watched.column) else {
                continue;
            };
            match user.contact(watched.field) {
                Some(stored) if stored == incoming => {}
                Some(stored) if !is_new => {
                    let mut payload = Map::new();
                    payload.insert("user_id".to_string(), Value::from(external_id.clone()));
                    payload.insert("field".to_string(), Value::from(watched.field));
                    payload.insert("old_value".to_string(), Value::from(stored));
                    payload.insert("new_value".to_string(), Value::from(incoming.clone()));
                    let payload = with_provenance(payload, mapping, &source_id);
                    events.push(DomainEvent::new(EventType::ContactFieldChanged, payload, timestamp));
                    tracing::info!(
                        external_id = %external_id,
                        field = watched.field,
                        "contact field changed"
                    );
                    self.store
                        .update_user_contact(&external_id, watched.field, Some(&incoming))
                        .await?;
                }
                _ => {
                    self.store
                        .update_user_contact(&external_id, watched.field, Some(&incoming))
                        .await?;
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings::MappingRegistry;
    use crate::store::MemorySyncStore;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn registry() -> MappingRegistry {
        MappingRegistry::marketplace().unwrap()
    }

    #[test]
    fn transform_stamps_provenance_and_cursor_timestamp() {
        let reg = registry();
        let m = reg.get("bookings").unwrap();
        let r = row(json!({
            "id": 77, "user_id": 1, "provider_id": 2, "status": "completed",
            "updated_at": "2026-03-01 12:00:00",
        }));
        let ev = transform_row(&r, m).unwrap();
        assert_eq!(ev.event_type, EventType::BookingCompleted);
        assert_eq!(ev.payload[KEY_SYNC_SOURCE], json!("data_sync"));
        assert_eq!(ev.payload[KEY_SOURCE_TABLE], json!("bookings"));
        assert_eq!(ev.payload[KEY_SOURCE_ID], json!("77"));
        assert_eq!(ev.timestamp.to_rfc3339(), "2026-03-01T12:00:00+00:00");
    }

    #[test]
    fn transform_is_deterministic_apart_from_ids() {
        let reg = registry();
        let m = reg.get("payments").unwrap();
        let r = row(json!({ "id": 5, "user_id": 9, "payment_status": "paid", "total_amount": "10.5" }));
        let a = transform_row(&r, m).unwrap();
        let b = transform_row(&r, m).unwrap();
        assert_eq!(a.event_type, b.event_type);
        assert_eq!(a.payload, b.payload);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn transform_without_cursor_uses_now() {
        let reg = registry();
        let m = reg.get("ratings").unwrap();
        let before = Utc::now();
        let ev = transform_row(&row(json!({ "id": 1 })), m).unwrap();
        assert!(ev.timestamp >= before);
    }

    #[test]
    fn transform_rejects_row_without_primary_key() {
        let reg = registry();
        let m = reg.get("ratings").unwrap();
        assert!(transform_row(&row(json!({ "rating": 4 })), m).is_err());
    }

    #[test]
    fn resolves_only_mapped_user_fields() {
        let mut payload = row(json!({
            "client_id": "1", "provider_id": "2", "booking_id": "1", "sender_id": "system",
        }));
        let ids = HashMap::from([("1".to_string(), "local-1".to_string())]);
        resolve_payload_user_ids(&mut payload, &ids);
        assert_eq!(payload["client_id"], json!("local-1"));
        assert_eq!(payload["provider_id"], json!("2"));
        assert_eq!(payload["booking_id"], json!("1"));
        assert_eq!(payload["sender_id"], json!("system"));
    }

    #[tokio::test]
    async fn ensure_entity_exists_is_idempotent() {
        let t = Transformer::new(Arc::new(MemorySyncStore::new()));
        let first = t.ensure_entity_exists("42").await.unwrap();
        let second = t.ensure_entity_exists("42").await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.local_id, second.local_id);
    }

    #[tokio::test]
    async fn provisions_both_parties_and_categories() {
        let store = Arc::new(MemorySyncStore::new());
        let t = Transformer::new(store.clone());
        let reg = registry();

        let booking = row(json!({ "id": 1, "user_id": 10, "provider_id": 20 }));
        let ents = t
            .ensure_entities_for_row(&booking, reg.get("bookings").unwrap())
            .await
            .unwrap();
        assert_eq!(ents.ids.len(), 2);
        assert!(ents.is_new("10") && ents.is_new("20"));

        let cat = row(json!({ "id": 3, "name": "Cleaning", "status": 1 }));
        t.ensure_entities_for_row(&cat, reg.get("categories").unwrap())
            .await
            .unwrap();
        let stored = store.find_category("3").await.unwrap().unwrap();
        assert_eq!(stored.name, "Cleaning");
        assert!(stored.active);
    }

    #[tokio::test]
    async fn contact_change_detection() {
        let store = Arc::new(MemorySyncStore::new());
        let t = Transformer::new(store.clone());
        let reg = registry();
        let users = reg.get("users").unwrap();

        let v1 = row(json!({ "id": 5, "email": "a@x.io", "phone_number": "+111" }));
        let ents = t.ensure_entities_for_row(&v1, users).await.unwrap();
        assert!(t.detect_field_changes(&v1, users, &ents).await.unwrap().is_empty());

        let v2 = row(json!({ "id": 5, "email": "b@x.io", "phone_number": "+111" }));
        let ents = t.ensure_entities_for_row(&v2, users).await.unwrap();
        let events = t.detect_field_changes(&v2, users, &ents).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ContactFieldChanged);
        assert_eq!(events[0].payload["field"], json!("email"));
        assert_eq!(events[0].payload["old_value"], json!("a@x.io"));
        assert_eq!(events[0].payload["new_value"], json!("b@x.io"));

        let stored = store.find_user_by_external_id("5").await.unwrap().unwrap();
        assert_eq!(stored.email.as_deref(), Some("b@x.io"));
        assert!(t.detect_field_changes(&v2, users, &ents).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_identity_tables_are_skipped() {
        let t = Transformer::new(Arc::new(MemorySyncStore::new()));
        let reg = registry();
        let m = reg.get("payments").unwrap();
        let r = row(json!({ "id": 1, "user_id": 5, "email": "x@y.z" }));
        let ents = t.ensure_entities_for_row(&r, m).await.unwrap();
        assert!(t.detect_field_changes(&r, m, &ents).await.unwrap().is_empty());
    }
}
