use async_trait::async_trait;

use super::models::{QueryResult, SqlParam};
use crate::config::ExternalDialect;
use crate::Result;

/// One wire dialect of the external source.
///
/// Implementations own their pool, put the session into read-only mode before
/// every query and enforce the per-query timeout. They do not inspect the SQL
/// they are given; the guarded connection does that before calling in.
#[async_trait]
pub trait ExternalDriver: Send + Sync {
    fn dialect(&self) -> ExternalDialect;

    /// Run a SELECT. `sql` uses `$1..$N` placeholders.
    async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<QueryResult>;

    async fn test_connection(&self) -> Result<()>;

    /// Release every pooled connection. The next query opens a fresh pool.
    async fn close(&self);
}
