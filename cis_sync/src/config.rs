use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Wire dialect of the external marketplace database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalDialect {
    Postgres,
    MySql,
}

impl ExternalDialect {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pg" | "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "pg",
            Self::MySql => "mysql",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::MySql => 3306,
        }
    }
}

/// Connection settings for the external (read-only) source.
#[derive(Clone)]
pub struct ExternalDbConfig {
    pub dialect: ExternalDialect,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl: bool,
    /// Postgres schema used for introspection. MySQL introspects `database`.
    pub schema: String,
    pub pool_max: u32,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub idle_timeout: Duration,
}

impl std::fmt::Debug for ExternalDbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalDbConfig")
            .field("dialect", &self.dialect)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("ssl", &self.ssl)
            .field("schema", &self.schema)
            .field("pool_max", &self.pool_max)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl Default for ExternalDbConfig {
    fn default() -> Self {
        Self {
            dialect: ExternalDialect::Postgres,
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "marketplace".to_string(),
            user: "cis_readonly".to_string(),
            password: String::new(),
            ssl: true,
            schema: "public".to_string(),
            pool_max: 3,
            connect_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures required to open the breaker.
    pub failure_threshold: u32,
    /// How long to remain open before a half-open trial call is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// What happens to the watermark when a row in the batch fails to transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkPolicy {
    /// Advance to the highest cursor read; failed rows are not retried.
    AdvancePastFailures,
    /// Stop at the last row before the first failure; failed rows are retried.
    HoldAtFirstFailure,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Global kill switch.
    pub enabled: bool,
    pub external: ExternalDbConfig,
    pub breaker: BreakerConfig,

    pub batch_size: u32,
    /// Primary poll interval.
    pub interval: Duration,
    /// Interval used while an external push channel is active (gap-fill only).
    pub gap_fill_interval: Duration,
    pub push_channel_active: bool,
    /// Upper bound for the doubled inter-cycle delay after failures.
    pub max_backoff: Duration,

    pub dedup_window: Duration,
    pub schema_cache_ttl: Duration,
    pub health_alert_window: Duration,
    pub validate_schema: bool,
    pub watermark_policy: WatermarkPolicy,

    /// Local SQLite file holding watermarks, run log and provisioned entities.
    pub local_db_path: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            external: ExternalDbConfig::default(),
            breaker: BreakerConfig::default(),
            batch_size: 100,
            interval: Duration::from_secs(30),
            gap_fill_interval: Duration::from_secs(300),
            push_channel_active: false,
            max_backoff: Duration::from_secs(600),
            dedup_window: Duration::from_secs(600),
            schema_cache_ttl: Duration::from_secs(300),
            health_alert_window: Duration::from_secs(3600),
            validate_schema: true,
            watermark_policy: WatermarkPolicy::AdvancePastFailures,
            local_db_path: PathBuf::from("./data/cis_sync.db"),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_ms(name: &str, default: Duration) -> Duration {
    env_u64(name).map(Duration::from_millis).unwrap_or(default)
}

impl SyncConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let dialect = match std::env::var("SYNC_DB_DRIVER") {
            Ok(v) => ExternalDialect::parse_str(&v).ok_or_else(|| {
                Error::InvalidInput(format!("SYNC_DB_DRIVER must be 'pg' or 'mysql', got {v:?}"))
            })?,
            Err(_) => d.external.dialect,
        };

        let external = ExternalDbConfig {
            dialect,
            host: std::env::var("SYNC_DB_HOST").unwrap_or(d.external.host),
            port: env_u64("SYNC_DB_PORT")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or_else(|| dialect.default_port()),
            database: std::env::var("SYNC_DB_NAME").unwrap_or(d.external.database),
            user: std::env::var("SYNC_DB_USER").unwrap_or(d.external.user),
            password: std::env::var("SYNC_DB_PASSWORD").unwrap_or_default(),
            ssl: env_bool("SYNC_DB_SSL").unwrap_or(d.external.ssl),
            schema: std::env::var("SYNC_DB_SCHEMA").unwrap_or(d.external.schema),
            pool_max: env_u64("SYNC_DB_POOL_MAX")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(d.external.pool_max),
            connect_timeout: env_ms("SYNC_DB_CONNECT_TIMEOUT_MS", d.external.connect_timeout),
            query_timeout: env_ms("SYNC_DB_QUERY_TIMEOUT_MS", d.external.query_timeout),
            idle_timeout: env_ms("SYNC_DB_IDLE_TIMEOUT_MS", d.external.idle_timeout),
        };

        let advance_past_failures = env_bool("SYNC_ADVANCE_PAST_FAILURES").unwrap_or(true);

        let cfg = Self {
            enabled: env_bool("SYNC_ENABLED").unwrap_or(d.enabled),
            external,
            breaker: BreakerConfig {
                failure_threshold: env_u64("SYNC_BREAKER_THRESHOLD")
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(d.breaker.failure_threshold),
                cooldown: env_ms("SYNC_BREAKER_COOLDOWN_MS", d.breaker.cooldown),
            },
            batch_size: env_u64("SYNC_BATCH_SIZE")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(d.batch_size),
            interval: env_ms("SYNC_INTERVAL_MS", d.interval),
            gap_fill_interval: env_ms("SYNC_FALLBACK_INTERVAL_MS", d.gap_fill_interval),
            push_channel_active: env_bool("SYNC_WEBHOOK_PUSH_ENABLED").unwrap_or(false),
            max_backoff: env_ms("SYNC_MAX_BACKOFF_MS", d.max_backoff),
            dedup_window: env_ms("SYNC_DEDUP_WINDOW_MS", d.dedup_window),
            schema_cache_ttl: env_ms("SYNC_SCHEMA_CACHE_TTL_MS", d.schema_cache_ttl),
            health_alert_window: d.health_alert_window,
            validate_schema: env_bool("SYNC_VALIDATE_SCHEMA").unwrap_or(d.validate_schema),
            watermark_policy: if advance_past_failures {
                WatermarkPolicy::AdvancePastFailures
            } else {
                WatermarkPolicy::HoldAtFirstFailure
            },
            local_db_path: std::env::var("SYNC_LOCAL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.local_db_path),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.external.host.trim().is_empty() {
            return Err(Error::InvalidInput("external.host is empty".to_string()));
        }
        if self.external.database.trim().is_empty() {
            return Err(Error::InvalidInput("external.database is empty".to_string()));
        }
        if self.external.user.trim().is_empty() {
            return Err(Error::InvalidInput("external.user is empty".to_string()));
        }
        if self.external.pool_max == 0 {
            return Err(Error::InvalidInput(
                "external.pool_max must be > 0".to_string(),
            ));
        }
        if self.external.connect_timeout.is_zero() || self.external.query_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "external timeouts must be > 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be > 0".to_string()));
        }
        if self.interval.is_zero() || self.gap_fill_interval.is_zero() {
            return Err(Error::InvalidInput("intervals must be > 0".to_string()));
        }
        if self.max_backoff < self.interval {
            return Err(Error::InvalidInput(
                "max_backoff must be >= interval".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::InvalidInput(
                "breaker.failure_threshold must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Base inter-cycle delay: the gap-fill interval when a push channel is active.
    pub fn effective_interval(&self) -> Duration {
        if self.push_channel_active {
            self.gap_fill_interval
        } else {
            self.interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_backoff_below_interval() {
        let cfg = SyncConfig {
            max_backoff: Duration::from_secs(1),
            ..SyncConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn effective_interval_switches_to_gap_fill() {
        let mut cfg = SyncConfig::default();
        assert_eq!(cfg.effective_interval(), cfg.interval);
        cfg.push_channel_active = true;
        assert_eq!(cfg.effective_interval(), cfg.gap_fill_interval);
    }

    #[test]
    fn debug_redacts_password() {
        let ext = ExternalDbConfig {
            password: "hunter2".to_string(),
            ..ExternalDbConfig::default()
        };
        let s = format!("{ext:?}");
        assert!(!s.contains("hunter2"));
    }

    #[test]
    fn dialect_parsing() {
        assert_eq!(ExternalDialect::parse_str("PG"), Some(ExternalDialect::Postgres));
        assert_eq!(ExternalDialect::parse_str("mysql"), Some(ExternalDialect::MySql));
        assert_eq!(ExternalDialect::parse_str("oracle"), None);
    }
}
