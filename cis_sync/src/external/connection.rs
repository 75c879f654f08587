//! Read-only enforcement in front of an [`ExternalDriver`].
//!
//! Every statement passes, in order: the verb guard, the template allowlist and
//! the circuit breaker. Only then does it reach the driver, which sets the
//! session read-only before running it. Outcomes feed back into the breaker;
//! refused credentials open it at once and drop the pool.

use std::sync::Arc;

use super::breaker::{BreakerSnapshot, CircuitBreaker};
use super::dialect::{grants_query, introspection_schema, introspection_templates, PING_QUERY};
use super::guard::{check_read_only, fingerprint, preview, QueryAllowlist};
use super::models::{PrivilegeReport, QueryResult, SqlParam};
use super::mysql::MySqlDriver;
use super::postgres::PostgresDriver;
use super::traits::ExternalDriver;
use crate::config::{BreakerConfig, ExternalDbConfig, ExternalDialect};
use crate::mappings::models::row_str;
use crate::mappings::MappingRegistry;
use crate::{Error, Result};

pub struct GuardedConnection {
    driver: Arc<dyn ExternalDriver>,
    allowlist: QueryAllowlist,
    breaker: CircuitBreaker,
    schema: String,
}

impl GuardedConnection {
    pub fn new(driver: Arc<dyn ExternalDriver>, breaker: &BreakerConfig, schema: impl Into<String>) -> Self {
        Self {
            driver,
            allowlist: QueryAllowlist::new(),
            breaker: CircuitBreaker::new(breaker),
            schema: schema.into(),
        }
    }

    /// Pick the driver for the configured dialect.
    pub fn from_config(cfg: &ExternalDbConfig, breaker: &BreakerConfig) -> Self {
        let driver: Arc<dyn ExternalDriver> = match cfg.dialect {
            ExternalDialect::Postgres => Arc::new(PostgresDriver::new(cfg.clone())),
            ExternalDialect::MySql => Arc::new(MySqlDriver::new(cfg.clone())),
        };
        Self::new(driver, breaker, introspection_schema(cfg))
    }

    pub fn dialect(&self) -> ExternalDialect {
        self.driver.dialect()
    }

    /// Schema name used for information-schema lookups.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn allowlist(&self) -> &QueryAllowlist {
        &self.allowlist
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot().await
    }

    /// Admit every mapping's poll template plus the fixed introspection queries.
    pub fn register_allowlist(&self, registry: &MappingRegistry) -> usize {
        let templates = registry
            .iter()
            .map(|m| m.poll_query())
            .chain(introspection_templates(self.dialect()).into_iter().map(|t| t.to_string()));
        let n = self.allowlist.register(templates);
        tracing::info!(templates = n, "external query allowlist registered");
        n
    }

    async fn admit(&self, sql: &str) -> Result<()> {
        if let Err(e) = check_read_only(sql, self.dialect()) {
            if let Error::ReadOnlyViolation { verb, preview } = &e {
                tracing::error!(
                    target: "cis_sync::security",
                    verb = %verb,
                    query = %preview,
                    "blocked non-SELECT statement against external source, tearing down pool"
                );
            }
            self.driver.close().await;
            return Err(e);
        }
        if let Err(e) = self.allowlist.check(sql) {
            tracing::warn!(
                target: "cis_sync::security",
                fingerprint = %fingerprint(sql),
                query = %preview(sql),
                "blocked unregistered query template"
            );
            return Err(e);
        }
        self.breaker.try_acquire().await
    }

    async fn settle<T>(&self, outcome: Result<T>) -> Result<T> {
        match &outcome {
            Ok(_) => self.breaker.record_success().await,
            Err(Error::AuthFailure(msg)) => {
                tracing::error!(
                    target: "cis_sync::security",
                    "external authentication failed, opening breaker and closing pool"
                );
                self.breaker.trip(msg).await;
                self.driver.close().await;
            }
            Err(e) if e.counts_toward_breaker() => self.breaker.record_failure(&e.to_string()).await,
            Err(_) => self.breaker.release_trial().await,
        }
        outcome
    }

    /// Run a guarded SELECT. `sql` uses `$1..$N` placeholders.
    #[tracing::instrument(level = "debug", skip(self, sql, params), fields(query = %preview(sql)))]
    pub async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<QueryResult> {
        self.admit(sql).await?;
        let outcome = self.driver.query(sql, params).await;
        self.settle(outcome).await
    }

    /// Reachability check through the same guards as any other query.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn test_connection(&self) -> bool {
        let outcome = match self.admit(PING_QUERY).await {
            Ok(()) => {
                let res = self.driver.test_connection().await;
                self.settle(res).await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "external connection test failed");
                false
            }
        }
    }

    /// Audit the account's grants. Fails closed: any write-capable grant, or
    /// any failure to read the grants, yields `safe = false`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn verify_read_only_privileges(&self) -> PrivilegeReport {
        let report = match self.query(grants_query(self.dialect()), &[]).await {
            Ok(res) => {
                let mut grants: Vec<String> = res
                    .rows
                    .iter()
                    .filter_map(|r| row_str(r, "privilege"))
                    .map(|g| g.trim().to_ascii_uppercase())
                    .collect();
                grants.sort();
                grants.dedup();
                PrivilegeReport::inspected(grants)
            }
            Err(e) => PrivilegeReport::uninspected(e.to_string()),
        };

        if !report.dangerous.is_empty() {
            tracing::error!(
                target: "cis_sync::security",
                grants = ?report.dangerous,
                "external account holds write privileges"
            );
        } else if let Some(err) = &report.error {
            tracing::warn!(
                target: "cis_sync::security",
                error = %err,
                "could not inspect external grants"
            );
        }
        report
    }

    pub async fn close(&self) {
        self.driver.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeFailure, FakeSource};
    use std::time::Duration;

    fn conn(fake: &Arc<FakeSource>, threshold: u32) -> GuardedConnection {
        GuardedConnection::new(
            fake.clone(),
            &BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(60),
            },
            "public",
        )
    }

    #[tokio::test]
    async fn write_statement_never_reaches_driver_and_tears_down_pool() {
        let fake = Arc::new(FakeSource::new(ExternalDialect::Postgres));
        let c = conn(&fake, 5);
        let err = c.query("DELETE FROM users", &[]).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnlyViolation { ref verb, .. } if verb == "DELETE"));
        assert_eq!(fake.query_count(), 0);
        assert_eq!(fake.close_count(), 1);
    }

    #[tokio::test]
    async fn unregistered_template_is_rejected_once_allowlist_is_populated() {
        let fake = Arc::new(FakeSource::new(ExternalDialect::Postgres));
        let c = conn(&fake, 5);
        c.query("SELECT email FROM users", &[]).await.unwrap();

        let registry = MappingRegistry::marketplace().unwrap();
        assert!(c.register_allowlist(&registry) >= registry.len());
        let err = c.query("SELECT email FROM users", &[]).await.unwrap_err();
        assert!(matches!(err, Error::QueryNotAllowed { .. }));
        assert_eq!(fake.query_count(), 1);

        let poll = registry.get("users").unwrap().poll_query();
        c.query(
            &poll,
            &[
                SqlParam::Timestamp(chrono::Utc::now()),
                SqlParam::I64(10),
                SqlParam::I64(0),
            ],
        )
        .await
        .unwrap();
        assert!(c.test_connection().await);
    }

    #[tokio::test]
    async fn failures_open_breaker_then_fail_fast() {
        let fake = Arc::new(FakeSource::new(ExternalDialect::Postgres));
        let c = conn(&fake, 2);
        fake.set_failure(Some(FakeFailure::Backend));
        assert!(c.query("SELECT 1", &[]).await.is_err());
        assert!(c.query("SELECT 1", &[]).await.is_err());
        assert_eq!(fake.query_count(), 2);

        let err = c.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(fake.query_count(), 2);
    }

    #[tokio::test]
    async fn auth_failure_opens_breaker_immediately() {
        let fake = Arc::new(FakeSource::new(ExternalDialect::MySql));
        let c = conn(&fake, 5);
        fake.set_failure(Some(FakeFailure::Auth));
        let err = c.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, Error::AuthFailure(_)));
        assert_eq!(fake.close_count(), 1);
        assert_eq!(
            c.breaker_snapshot().await.state,
            crate::external::BreakerState::Open
        );
        assert!(!c.test_connection().await);
    }

    #[tokio::test]
    async fn privilege_audit_flags_write_grants() {
        let fake = Arc::new(FakeSource::new(ExternalDialect::Postgres));
        let c = conn(&fake, 5);
        fake.set_grants(&["SELECT"]);
        let ok = c.verify_read_only_privileges().await;
        assert!(ok.safe);
        assert_eq!(ok.grants, vec!["SELECT".to_string()]);

        fake.set_grants(&["SELECT", "insert", "UPDATE"]);
        let bad = c.verify_read_only_privileges().await;
        assert!(!bad.safe);
        assert_eq!(bad.dangerous, vec!["INSERT".to_string(), "UPDATE".to_string()]);
    }

    #[tokio::test]
    async fn privilege_audit_fails_closed_when_uninspectable() {
        let fake = Arc::new(FakeSource::new(ExternalDialect::Postgres));
        let c = conn(&fake, 5);
        fake.set_failure(Some(FakeFailure::Backend));
        let report = c.verify_read_only_privileges().await;
        assert!(!report.safe);
        assert!(report.error.is_some());
        assert!(report.grants.is_empty());
    }
}
