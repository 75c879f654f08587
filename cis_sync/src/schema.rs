//! Schema drift detection for mapped source tables.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::events::{Alert, AlertPriority, AlertSink};
use crate::external::dialect::columns_query;
use crate::external::{GuardedConnection, SqlParam};
use crate::mappings::models::row_str;
use crate::mappings::TableMapping;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDriftResult {
    pub table: String,
    pub valid: bool,
    /// Columns the mapping reads that the source no longer has.
    pub missing_columns: Vec<String>,
    /// Source columns the mapping ignores. Informational.
    pub extra_columns: Vec<String>,
    /// Order-independent hash of the source's `column:type` pairs.
    pub checksum: String,
    pub checked_at: DateTime<Utc>,
    /// Set when introspection itself failed.
    pub error: Option<String>,
}

/// Hash of sorted `column:type` pairs.
pub fn schema_checksum(columns: &[(String, String)]) -> String {
    let mut pairs: Vec<String> = columns.iter().map(|(c, t)| format!("{c}:{t}")).collect();
    pairs.sort();
    let mut hasher = Sha256::new();
    hasher.update(pairs.join(",").as_bytes());
    hex::encode(hasher.finalize())
}

pub struct SchemaValidator {
    connection: Arc<GuardedConnection>,
    alerts: Arc<dyn AlertSink>,
    ttl: Duration,
    cache: DashMap<String, SchemaDriftResult>,
}

impl SchemaValidator {
    pub fn new(connection: Arc<GuardedConnection>, alerts: Arc<dyn AlertSink>, ttl: Duration) -> Self {
        Self {
            connection,
            alerts,
            ttl,
            cache: DashMap::new(),
        }
    }

    pub async fn validate_table_schema(&self, mapping: &TableMapping) -> SchemaDriftResult {
        self.validate_table_schema_at(mapping, Utc::now()).await
    }

    /// Diff the mapping's projection against the live columns.
    ///
    /// Only valid results are cached. Introspection failures come back invalid
    /// without an alert; missing columns raise one high-priority alert.
    #[tracing::instrument(level = "debug", skip(self, mapping), fields(table = mapping.source_table))]
    pub async fn validate_table_schema_at(&self, mapping: &TableMapping, now: DateTime<Utc>) -> SchemaDriftResult {
        let table = mapping.source_table;
        if let Some(hit) = self.cache.get(table) {
            let age = (now - hit.checked_at).to_std().unwrap_or_default();
            if age < self.ttl {
                return hit.clone();
            }
        }
        self.cache.remove(table);

        let sql = columns_query(self.connection.dialect());
        let params = [
            SqlParam::Text(self.connection.schema().to_string()),
            SqlParam::Text(table.to_string()),
        ];
        let actual: Vec<(String, String)> = match self.connection.query(sql, &params).await {
            Ok(res) => res
                .rows
                .iter()
                .filter_map(|r| {
                    let name = row_str(r, "column_name")?.to_ascii_lowercase();
                    Some((name, row_str(r, "data_type").unwrap_or_default().to_ascii_lowercase()))
                })
                .collect(),
            Err(e) => {
                tracing::warn!(table, error = %e, "schema introspection failed");
                return SchemaDriftResult {
                    table: table.to_string(),
                    valid: false,
                    missing_columns: Vec::new(),
                    extra_columns: Vec::new(),
                    checksum: String::new(),
                    checked_at: now,
                    error: Some(e.to_string()),
                };
            }
        };

        let expected = mapping.projection_columns();
        let missing: Vec<String> = expected
            .iter()
            .filter(|c| !actual.iter().any(|(a, _)| a == *c))
            .cloned()
            .collect();
        let extra: Vec<String> = actual
            .iter()
            .map(|(a, _)| a.clone())
            .filter(|a| !expected.contains(a))
            .collect();

        let result = SchemaDriftResult {
            table: table.to_string(),
            valid: missing.is_empty(),
            missing_columns: missing,
            extra_columns: extra,
            checksum: schema_checksum(&actual),
            checked_at: now,
            error: None,
        };

        if result.valid {
            if !result.extra_columns.is_empty() {
                tracing::debug!(table, extra = ?result.extra_columns, "source has unmapped columns");
            }
            self.cache.insert(table.to_string(), result.clone());
        } else {
            tracing::error!(table, missing = ?result.missing_columns, "schema drift detected");
            let alert = Alert::system(
                AlertPriority::High,
                "schema_drift_detector",
                format!("Schema drift on {table}"),
                format!(
                    "Source table '{table}' is missing mapped columns: {}",
                    result.missing_columns.join(", ")
                ),
                serde_json::json!({
                    "table": table,
                    "missingColumns": result.missing_columns,
                    "checksum": result.checksum,
                }),
            );
            if let Err(e) = self.alerts.create_alert(alert).await {
                tracing::warn!(table, error = %e, "failed to raise schema drift alert");
            }
        }
        result
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, ExternalDialect};
    use crate::events::memory::MemoryAlertSink;
    use crate::mappings::MappingRegistry;
    use crate::test_support::{FakeFailure, FakeSource};

    struct Rig {
        fake: Arc<FakeSource>,
        alerts: Arc<MemoryAlertSink>,
        validator: SchemaValidator,
        registry: MappingRegistry,
    }

    fn rig() -> Rig {
        let fake = Arc::new(FakeSource::new(ExternalDialect::Postgres));
        let registry = MappingRegistry::marketplace().unwrap();
        fake.with_mapping_columns(&registry);
        let conn = Arc::new(GuardedConnection::new(fake.clone(), &BreakerConfig::default(), "public"));
        let alerts = Arc::new(MemoryAlertSink::new());
        let validator = SchemaValidator::new(conn, alerts.clone(), Duration::from_secs(300));
        Rig { fake, alerts, validator, registry }
    }

    #[tokio::test]
    async fn valid_schema_is_cached_until_ttl_or_clear() {
        let r = rig();
        let m = r.registry.get("ratings").unwrap();
        let t0 = Utc::now();

        let first = r.validator.validate_table_schema_at(m, t0).await;
        assert!(first.valid);
        assert_eq!(r.fake.query_count(), 1);

        r.validator
            .validate_table_schema_at(m, t0 + chrono::Duration::seconds(60))
            .await;
        assert_eq!(r.fake.query_count(), 1);

        r.validator
            .validate_table_schema_at(m, t0 + chrono::Duration::seconds(301))
            .await;
        assert_eq!(r.fake.query_count(), 2);

        r.validator.clear_cache();
        r.validator.validate_table_schema_at(m, t0 + chrono::Duration::seconds(302)).await;
        assert_eq!(r.fake.query_count(), 3);
    }

    #[tokio::test]
    async fn missing_column_invalidates_and_alerts_once() {
        let r = rig();
        let m = r.registry.get("ratings").unwrap();
        let cols: Vec<(String, String)> = m
            .projection_columns()
            .into_iter()
            .filter(|c| c != "review")
            .map(|c| (c, "text".to_string()))
            .chain([("legacy_flag".to_string(), "int".to_string())])
            .collect();
        let refs: Vec<(&str, &str)> = cols.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        r.fake.set_columns("ratings", &refs);

        let res = r.validator.validate_table_schema(m).await;
        assert!(!res.valid);
        assert_eq!(res.missing_columns, vec!["review".to_string()]);
        assert_eq!(res.extra_columns, vec!["legacy_flag".to_string()]);

        let alerts = r.alerts.all_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].priority, AlertPriority::High);
        assert!(alerts[0].description.contains("review"));

        r.validator.validate_table_schema(m).await;
        assert_eq!(r.fake.query_count(), 2);
    }

    #[tokio::test]
    async fn introspection_failure_fails_closed_without_alert() {
        let r = rig();
        r.fake.set_failure(Some(FakeFailure::Backend));
        let res = r
            .validator
            .validate_table_schema(r.registry.get("users").unwrap())
            .await;
        assert!(!res.valid);
        assert!(res.error.is_some());
        assert!(r.alerts.all_alerts().await.is_empty());
    }

    #[test]
    fn checksum_ignores_column_order() {
        let a = vec![("id".to_string(), "int".to_string()), ("name".to_string(), "text".to_string())];
        let b = vec![("name".to_string(), "text".to_string()), ("id".to_string(), "int".to_string())];
        assert_eq!(schema_checksum(&a), schema_checksum(&b));
        assert_ne!(schema_checksum(&a), schema_checksum(&a[..1]));
    }
}
