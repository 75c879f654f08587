//! MySQL / MariaDB wire dialect.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Arguments, Column, MySql, MySqlPool, Row, TypeInfo};
use tokio::sync::RwLock;

use super::dialect::{classify_sqlx_error, convert_placeholders, read_only_session_sql, PING_QUERY};
use super::models::{QueryResult, SqlParam};
use super::traits::ExternalDriver;
use crate::config::{ExternalDbConfig, ExternalDialect};
use crate::mappings::Row as SourceRow;
use crate::{Error, Result};

const DIALECT: ExternalDialect = ExternalDialect::MySql;

pub struct MySqlDriver {
    cfg: ExternalDbConfig,
    pool: RwLock<Option<MySqlPool>>,
}

impl MySqlDriver {
    pub fn new(cfg: ExternalDbConfig) -> Self {
        Self {
            cfg,
            pool: RwLock::new(None),
        }
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.cfg.host)
            .port(self.cfg.port)
            .username(&self.cfg.user)
            .password(&self.cfg.password)
            .database(&self.cfg.database)
            .ssl_mode(if self.cfg.ssl {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Disabled
            })
    }

    async fn pool(&self) -> MySqlPool {
        if let Some(p) = self.pool.read().await.as_ref() {
            return p.clone();
        }
        let mut guard = self.pool.write().await;
        if let Some(p) = guard.as_ref() {
            return p.clone();
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(self.cfg.pool_max)
            .min_connections(0)
            .acquire_timeout(self.cfg.connect_timeout)
            .idle_timeout(self.cfg.idle_timeout)
            .connect_lazy_with(self.connect_options());
        tracing::debug!(host = %self.cfg.host, database = %self.cfg.database, "external mysql pool created");
        *guard = Some(pool.clone());
        pool
    }

    /// Bind in the order the rewritten `?` markers expect.
    fn add_params(args: &mut MySqlArguments, params: &[SqlParam], order: &[usize]) -> Result<()> {
        let bind_err = |e: sqlx::error::BoxDynError| Error::BackendMessage(format!("mysql bind: {e}"));
        for &idx in order {
            let p = params.get(idx).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "placeholder ${} has no parameter ({} given)",
                    idx + 1,
                    params.len()
                ))
            })?;
            match p {
                SqlParam::Null => args.add(Option::<String>::None).map_err(bind_err)?,
                SqlParam::Bool(b) => args.add(*b).map_err(bind_err)?,
                SqlParam::I64(i) => args.add(*i).map_err(bind_err)?,
                SqlParam::F64(f) => args.add(*f).map_err(bind_err)?,
                SqlParam::Text(s) => args.add(s.clone()).map_err(bind_err)?,
                // DATETIME columns carry no zone; the source writes UTC.
                SqlParam::Timestamp(t) => args.add(t.naive_utc()).map_err(bind_err)?,
            }
        }
        Ok(())
    }

    async fn run(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<SourceRow>> {
        let converted = convert_placeholders(sql, DIALECT);
        let mut args = MySqlArguments::default();
        Self::add_params(&mut args, params, &converted.bind_order)?;

        let pool = self.pool().await;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| classify_sqlx_error(DIALECT, "mysql acquire", e))?;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(read_only_session_sql(DIALECT)))
            .await
            .map_err(|e| classify_sqlx_error(DIALECT, "mysql set read only", e))?;

        let rows = sqlx::query_with(&converted.sql, args)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| classify_sqlx_error(DIALECT, "mysql query", e))?;
        Ok(rows.iter().map(mysql_row_to_json).collect())
    }
}

#[async_trait]
impl ExternalDriver for MySqlDriver {
    fn dialect(&self) -> ExternalDialect {
        DIALECT
    }

    #[tracing::instrument(level = "debug", skip(self, params), fields(params = params.len()))]
    async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<QueryResult> {
        let timeout = self.cfg.query_timeout;
        let rows = tokio::time::timeout(timeout, self.run(sql, params))
            .await
            .map_err(|_| Error::Timeout(timeout.as_millis() as u64))??;
        Ok(QueryResult::from_rows(rows))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn test_connection(&self) -> Result<()> {
        self.query(PING_QUERY, &[]).await.map(|_| ())
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            tracing::info!("external mysql pool closed");
        }
    }
}

fn get<'r, T>(row: &'r MySqlRow, idx: usize) -> Option<T>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

fn text(row: &MySqlRow, idx: usize) -> Option<String> {
    get::<String>(row, idx).or_else(|| row.try_get_unchecked::<Option<String>, _>(idx).ok().flatten())
}

fn mysql_value(row: &MySqlRow, idx: usize, type_name: &str) -> Option<Value> {
    if type_name.ends_with("UNSIGNED") {
        return get::<u64>(row, idx).map(Value::from);
    }
    match type_name {
        "BOOLEAN" => get::<bool>(row, idx).map(Value::from),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            get::<i64>(row, idx).map(Value::from)
        }
        "FLOAT" => get::<f32>(row, idx).map(|f| Value::from(f as f64)),
        "DOUBLE" => get::<f64>(row, idx).map(Value::from),
        // DECIMAL arrives as its text form.
        "DECIMAL" => text(row, idx)
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(Value::from),
        "TIMESTAMP" => get::<DateTime<Utc>>(row, idx).map(|t| Value::from(t.to_rfc3339())),
        "DATETIME" => get::<NaiveDateTime>(row, idx)
            .map(|t| Value::from(Utc.from_utc_datetime(&t).to_rfc3339())),
        "DATE" => get::<NaiveDate>(row, idx).map(|d| Value::from(d.to_string())),
        "JSON" => get::<Value>(row, idx),
        _ => text(row, idx).map(Value::from),
    }
}

fn mysql_row_to_json(row: &MySqlRow) -> SourceRow {
    let mut out = SourceRow::new();
    for (idx, col) in row.columns().iter().enumerate() {
        let type_name = col.type_info().name().to_ascii_uppercase();
        let v = mysql_value(row, idx, &type_name).unwrap_or(Value::Null);
        out.insert(col.name().to_string(), v);
    }
    out
}
