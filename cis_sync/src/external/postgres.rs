//! Postgres wire dialect.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Arguments, Column, PgPool, Postgres, Row, TypeInfo};
use tokio::sync::RwLock;

use super::dialect::{classify_sqlx_error, convert_placeholders, read_only_session_sql, PING_QUERY};
use super::models::{QueryResult, SqlParam};
use super::traits::ExternalDriver;
use crate::config::{ExternalDbConfig, ExternalDialect};
use crate::mappings::Row as SourceRow;
use crate::{Error, Result};

const DIALECT: ExternalDialect = ExternalDialect::Postgres;

pub struct PostgresDriver {
    cfg: ExternalDbConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresDriver {
    pub fn new(cfg: ExternalDbConfig) -> Self {
        Self {
            cfg,
            pool: RwLock::new(None),
        }
    }

    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.cfg.host)
            .port(self.cfg.port)
            .username(&self.cfg.user)
            .password(&self.cfg.password)
            .database(&self.cfg.database)
            .ssl_mode(if self.cfg.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Disable
            })
    }

    /// Pool is created lazily and holds no connections while idle.
    async fn pool(&self) -> PgPool {
        if let Some(p) = self.pool.read().await.as_ref() {
            return p.clone();
        }
        let mut guard = self.pool.write().await;
        if let Some(p) = guard.as_ref() {
            return p.clone();
        }
        let pool = PgPoolOptions::new()
            .max_connections(self.cfg.pool_max)
            .min_connections(0)
            .acquire_timeout(self.cfg.connect_timeout)
            .idle_timeout(self.cfg.idle_timeout)
            .connect_lazy_with(self.connect_options());
        tracing::debug!(host = %self.cfg.host, database = %self.cfg.database, "external pg pool created");
        *guard = Some(pool.clone());
        pool
    }

    fn add_params(args: &mut PgArguments, params: &[SqlParam]) -> Result<()> {
        let bind_err = |e: sqlx::error::BoxDynError| Error::BackendMessage(format!("pg bind: {e}"));
        for p in params {
            match p {
                SqlParam::Null => args.add(Option::<String>::None).map_err(bind_err)?,
                SqlParam::Bool(b) => args.add(*b).map_err(bind_err)?,
                SqlParam::I64(i) => args.add(*i).map_err(bind_err)?,
                SqlParam::F64(f) => args.add(*f).map_err(bind_err)?,
                SqlParam::Text(s) => args.add(s.clone()).map_err(bind_err)?,
                SqlParam::Timestamp(t) => args.add(*t).map_err(bind_err)?,
            }
        }
        Ok(())
    }

    async fn run(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<SourceRow>> {
        let converted = convert_placeholders(sql, DIALECT);
        let pool = self.pool().await;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| classify_sqlx_error(DIALECT, "pg acquire", e))?;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(read_only_session_sql(DIALECT)))
            .await
            .map_err(|e| classify_sqlx_error(DIALECT, "pg set read only", e))?;

        let mut args = PgArguments::default();
        Self::add_params(&mut args, params)?;
        let rows = sqlx::query_with(&converted.sql, args)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| classify_sqlx_error(DIALECT, "pg query", e))?;
        Ok(rows.iter().map(pg_row_to_json).collect())
    }
}

#[async_trait]
impl ExternalDriver for PostgresDriver {
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
            tracing::info!("external pg pool closed");
        }
    }
}

fn get<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

fn raw_bytes(row: &PgRow, idx: usize) -> Option<Vec<u8>> {
    row.try_get_unchecked::<Option<Vec<u8>>, _>(idx).ok().flatten()
}

fn pg_value(row: &PgRow, idx: usize, type_name: &str) -> Option<Value> {
    match type_name {
        "BOOL" => get::<bool>(row, idx).map(Value::from),
        "INT2" => get::<i16>(row, idx).map(Value::from),
        "INT4" => get::<i32>(row, idx).map(Value::from),
        "INT8" => get::<i64>(row, idx).map(Value::from),
        "FLOAT4" => get::<f32>(row, idx).map(|f| Value::from(f as f64)),
        "FLOAT8" => get::<f64>(row, idx).map(Value::from),
        "NUMERIC" => raw_bytes(row, idx)
            .and_then(|b| decode_numeric(&b))
            .map(Value::from),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, idx).map(|t| Value::from(t.to_rfc3339())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, idx)
            .map(|t| Value::from(Utc.from_utc_datetime(&t).to_rfc3339())),
        "DATE" => get::<NaiveDate>(row, idx).map(|d| Value::from(d.to_string())),
        "JSON" | "JSONB" => get::<Value>(row, idx),
        "UUID" => raw_bytes(row, idx)
            .and_then(|b| uuid::Uuid::from_slice(&b).ok())
            .map(|u| Value::from(u.to_string())),
        _ => get::<String>(row, idx)
            .or_else(|| row.try_get_unchecked::<Option<String>, _>(idx).ok().flatten())
            .map(Value::from),
    }
}

fn pg_row_to_json(row: &PgRow) -> SourceRow {
    let mut out = SourceRow::new();
    for (idx, col) in row.columns().iter().enumerate() {
        let type_name = col.type_info().name().to_ascii_uppercase();
        let v = pg_value(row, idx, &type_name).unwrap_or(Value::Null);
        out.insert(col.name().to_string(), v);
    }
    out
}

/// Binary NUMERIC: ndigits, weight, sign, dscale (all 16-bit), then base-10000 digits.
fn decode_numeric(bytes: &[u8]) -> Option<f64> {
    let word = |i: usize| -> Option<i16> {
        bytes
            .get(i * 2..i * 2 + 2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
    };
    let ndigits = word(0)? as usize;
    let weight = word(1)? as i32;
    let sign = word(2)? as u16;
    if sign == 0xC000 {
        return None;
    }
    let mut value = 0f64;
    for i in 0..ndigits {
        let digit = word(4 + i)? as f64;
        value += digit * 10000f64.powi(weight - i as i32);
    }
    Some(if sign == 0x4000 { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: i16, weight: i16, sign: u16, digits: &[i16]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&ndigits.to_be_bytes());
        b.extend_from_slice(&weight.to_be_bytes());
        b.extend_from_slice(&sign.to_be_bytes());
        b.extend_from_slice(&2i16.to_be_bytes());
        for d in digits {
            b.extend_from_slice(&d.to_be_bytes());
        }
        b
    }

    #[test]
    fn decodes_binary_numeric() {
        // 12345.67 = [1, 2345, 6700] with weight 1
        let v = decode_numeric(&numeric(3, 1, 0, &[1, 2345, 6700])).unwrap();
        assert!((v - 12345.67).abs() < 1e-9);
        let neg = decode_numeric(&numeric(1, 0, 0x4000, &[42])).unwrap();
        assert_eq!(neg, -42.0);
        assert_eq!(decode_numeric(&numeric(0, 0, 0, &[])), Some(0.0));
        assert_eq!(decode_numeric(&numeric(0, 0, 0xC000, &[])), None);
        assert_eq!(decode_numeric(&[0, 1]), None);
    }
}
