//! Scripted external source and a fully wired service for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::{json, Value};

use crate::config::{ExternalDialect, SyncConfig};
use crate::events::memory::{MemoryAlertSink, MemoryEventBus};
use crate::external::{ExternalDriver, GuardedConnection, QueryResult, SqlParam};
use crate::mappings::models::{row_f64, row_timestamp};
use crate::mappings::{MappingRegistry, Row};
use crate::orchestrator::SyncService;
use crate::store::{
    LocalCategory, LocalUser, MemorySyncStore, SyncRunRecord, SyncStore, Watermark, WatermarkAdvance,
};
use crate::{Error, Result};

pub fn row(v: Value) -> Row {
    v.as_object().cloned().expect("row literal must be an object")
}

/// Epoch seconds as a timestamp; matches integer cursor values in test rows.
pub fn secs(n: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(n, 0).single().expect("valid timestamp")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    Backend,
    Auth,
    Timeout,
}

impl FakeFailure {
    fn to_error(self) -> Error {
        match self {
            Self::Backend => Error::BackendMessage("connection reset by peer".to_string()),
            Self::Auth => Error::AuthFailure("Access denied for user 'cis_readonly'".to_string()),
            Self::Timeout => Error::Timeout(15_000),
        }
    }
}

#[derive(Default)]
struct FakeState {
    failure: Option<FakeFailure>,
    grants: Vec<String>,
    rows: HashMap<String, Vec<Row>>,
    columns: HashMap<String, Vec<(String, String)>>,
    queries: Vec<String>,
    closes: usize,
}

/// In-memory stand-in for the external database.
///
/// Serves poll templates from pushed rows (cursor filter, ordering and limit
/// applied), answers the column and grant introspection queries, and can be
/// told to fail every call.
pub struct FakeSource {
    dialect: ExternalDialect,
    state: Mutex<FakeState>,
    poll_re: Regex,
}

impl FakeSource {
    pub fn new(dialect: ExternalDialect) -> Self {
        Self {
            dialect,
            state: Mutex::new(FakeState {
                grants: vec!["SELECT".to_string()],
                ..FakeState::default()
            }),
            poll_re: Regex::new(
                r"(?i)\bFROM\s+(\w+)\s+WHERE\s+\((\w+)\s*>\s*\$1\s+OR\s+\(\w+\s*=\s*\$1\s+AND\s+(\w+)\s*>\s*\$3\)\)",
            )
            .expect("static regex"),
        }
    }

    pub fn set_failure(&self, failure: Option<FakeFailure>) {
        self.state.lock().unwrap().failure = failure;
    }

    pub fn set_grants(&self, grants: &[&str]) {
        self.state.lock().unwrap().grants = grants.iter().map(|g| g.to_string()).collect();
    }

    pub fn push_rows(&self, table: &str, rows: Vec<Row>) {
        self.state
            .lock()
            .unwrap()
            .rows
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn set_columns(&self, table: &str, columns: &[(&str, &str)]) {
        self.state.lock().unwrap().columns.insert(
            table.to_string(),
            columns
                .iter()
                .map(|(c, t)| (c.to_string(), t.to_string()))
                .collect(),
        );
    }

    /// Give every mapped table exactly the columns its projection reads.
    pub fn with_mapping_columns(&self, registry: &MappingRegistry) {
        let mut state = self.state.lock().unwrap();
        for m in registry.iter() {
            let cols = m
                .projection_columns()
                .into_iter()
                .map(|c| (c, "text".to_string()))
                .collect();
            state.columns.insert(m.source_table.to_string(), cols);
        }
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().unwrap().queries.len()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    fn answer(&self, state: &FakeState, sql: &str, params: &[SqlParam]) -> QueryResult {
        let lower = sql.to_ascii_lowercase();
        if lower.trim() == "select 1" {
            return QueryResult::from_rows(vec![row(json!({ "?column?": 1 }))]);
        }
        if lower.contains("information_schema.columns") {
            let table = match params.get(1) {
                Some(SqlParam::Text(t)) => t.as_str(),
                _ => "",
            };
            let rows = state
                .columns
                .get(table)
                .map(|cols| {
                    cols.iter()
                        .map(|(c, t)| row(json!({ "column_name": c, "data_type": t })))
                        .collect()
                })
                .unwrap_or_default();
            return QueryResult::from_rows(rows);
        }
        if lower.contains("as privilege") {
            let rows = state
                .grants
                .iter()
                .map(|g| row(json!({ "privilege": g })))
                .collect();
            return QueryResult::from_rows(rows);
        }
        if let Some(caps) = self.poll_re.captures(sql) {
            let (table, cursor, pk) = (&caps[1], &caps[2], &caps[3]);
            let after = match params.first() {
                Some(SqlParam::Timestamp(t)) => *t,
                _ => secs(0),
            };
            let after_id = match params.get(2) {
                Some(SqlParam::I64(n)) => *n as f64,
                Some(SqlParam::Text(t)) => t.parse().unwrap_or(f64::MIN),
                _ => f64::MIN,
            };
            let limit = match params.get(1) {
                Some(SqlParam::I64(n)) => usize::try_from(*n).unwrap_or(0),
                _ => usize::MAX,
            };
            let mut rows: Vec<Row> = state
                .rows
                .get(table)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| match row_timestamp(r, cursor) {
                            Some(t) if t == after => row_f64(r, pk) > after_id,
                            Some(t) => t > after,
                            None => false,
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            rows.sort_by(|a, b| {
                row_timestamp(a, cursor)
                    .cmp(&row_timestamp(b, cursor))
                    .then_with(|| row_f64(a, pk).total_cmp(&row_f64(b, pk)))
            });
            rows.truncate(limit);
            return QueryResult::from_rows(rows);
        }
        QueryResult::default()
    }
}

#[async_trait]
impl ExternalDriver for FakeSource {
    fn dialect(&self) -> ExternalDialect {
        self.dialect
    }

    async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<QueryResult> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(sql.to_string());
        if let Some(f) = state.failure {
            return Err(f.to_error());
        }
        Ok(self.answer(&state, sql, params))
    }

    async fn test_connection(&self) -> Result<()> {
        match self.state.lock().unwrap().failure {
            Some(f) => Err(f.to_error()),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        self.state.lock().unwrap().closes += 1;
    }
}

/// A local store whose every call fails, as if the database file were gone.
pub struct UnavailableStore;

fn unavailable<T>() -> Result<T> {
    Err(Error::BackendMessage("local store unavailable".to_string()))
}

#[async_trait]
impl SyncStore for UnavailableStore {
    async fn register_table(&self, _table: &str) -> Result<()> {
        unavailable()
    }

    async fn get_watermark(&self, _table: &str) -> Result<Option<Watermark>> {
        unavailable()
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>> {
        unavailable()
    }

    async fn advance_watermark(&self, _table: &str, _advance: &WatermarkAdvance) -> Result<()> {
        unavailable()
    }

    async fn set_table_enabled(&self, _table: &str, _enabled: bool) -> Result<()> {
        unavailable()
    }

    async fn reset_watermark(&self, _table: &str) -> Result<()> {
        unavailable()
    }

    async fn append_run(&self, _run: &SyncRunRecord) -> Result<()> {
        unavailable()
    }

    async fn list_runs(&self, _limit: usize) -> Result<Vec<SyncRunRecord>> {
        unavailable()
    }

    async fn runs_since(&self, _since: DateTime<Utc>) -> Result<Vec<SyncRunRecord>> {
        unavailable()
    }

    async fn find_user_by_external_id(&self, _external_id: &str) -> Result<Option<LocalUser>> {
        unavailable()
    }

    async fn insert_user_if_absent(&self, _user: &LocalUser) -> Result<bool> {
        unavailable()
    }

    async fn update_user_contact(&self, _external_id: &str, _field: &str, _value: Option<&str>) -> Result<()> {
        unavailable()
    }

    async fn upsert_category(&self, _category: &LocalCategory) -> Result<LocalCategory> {
        unavailable()
    }

    async fn find_category(&self, _external_id: &str) -> Result<Option<LocalCategory>> {
        unavailable()
    }
}

/// A bootstrapped `SyncService` over a `FakeSource` and in-memory collaborators.
pub struct Harness {
    pub service: Arc<SyncService>,
    pub fake: Arc<FakeSource>,
    pub store: Arc<MemorySyncStore>,
    pub bus: Arc<MemoryEventBus>,
    pub alerts: Arc<MemoryAlertSink>,
}

impl Harness {
    pub async fn new(configure: impl FnOnce(&mut SyncConfig)) -> Self {
        let mut cfg = SyncConfig {
            enabled: true,
            ..SyncConfig::default()
        };
        configure(&mut cfg);

        let registry = Arc::new(MappingRegistry::marketplace().unwrap());
        let fake = Arc::new(FakeSource::new(cfg.external.dialect));
        fake.with_mapping_columns(&registry);
        let connection = Arc::new(GuardedConnection::new(fake.clone(), &cfg.breaker, "public"));
        let store = Arc::new(MemorySyncStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let alerts = Arc::new(MemoryAlertSink::new());

        let service = Arc::new(SyncService::new(
            cfg,
            registry,
            connection,
            store.clone(),
            bus.clone(),
            alerts.clone(),
        ));
        service.bootstrap().await.unwrap();
        Self {
            service,
            fake,
            store,
            bus,
            alerts,
        }
    }
}
