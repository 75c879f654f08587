//! Per-dialect SQL: placeholder conversion, session setup, introspection
//! templates and error classification.

use crate::config::{ExternalDbConfig, ExternalDialect};
use crate::Error;

pub const PING_QUERY: &str = "SELECT 1";

/// Rewritten statement plus the 0-based parameter index each native marker binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedSql {
    pub sql: String,
    pub bind_order: Vec<usize>,
}

/// Rewrite `$N` markers into the dialect's native form.
///
/// Postgres is left untouched. MySQL gets one `?` per marker, in textual order,
/// with `bind_order` recording which parameter each `?` takes so `$2 ... $1`
/// and repeated markers bind correctly. Markers inside string literals are
/// left alone.
pub fn convert_placeholders(sql: &str, dialect: ExternalDialect) -> ConvertedSql {
    let mut out = String::with_capacity(sql.len());
    let mut bind_order = Vec::new();
    let mut chars = sql.char_indices().peekable();
    let mut in_quote = false;

    while let Some((_, ch)) = chars.next() {
        if ch == '\'' {
            in_quote = !in_quote;
            out.push(ch);
            continue;
        }
        if ch != '$' || in_quote {
            out.push(ch);
            continue;
        }
        let mut digits = String::new();
        while let Some(&(_, d)) = chars.peek() {
            if d.is_ascii_digit() {
                digits.push(d);
                chars.next();
            } else {
                break;
            }
        }
        match digits.parse::<usize>() {
            Ok(n) if n >= 1 => {
                bind_order.push(n - 1);
                match dialect {
                    ExternalDialect::Postgres => {
                        out.push('$');
                        out.push_str(&digits);
                    }
                    ExternalDialect::MySql => out.push('?'),
                }
            }
            _ => {
                out.push('$');
                out.push_str(&digits);
            }
        }
    }

    ConvertedSql {
        sql: out,
        bind_order,
    }
}

/// Statement issued on the pooled connection before every query round.
pub fn read_only_session_sql(dialect: ExternalDialect) -> &'static str {
    match dialect {
        ExternalDialect::Postgres => "SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY",
        ExternalDialect::MySql => "SET SESSION TRANSACTION READ ONLY",
    }
}

/// `(column_name, data_type)` for one table. `$1` is the schema, `$2` the table.
pub fn columns_query(dialect: ExternalDialect) -> &'static str {
    match dialect {
        ExternalDialect::Postgres => {
            "SELECT column_name::text AS column_name, data_type::text AS data_type \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position"
        }
        ExternalDialect::MySql => {
            "SELECT COLUMN_NAME AS column_name, DATA_TYPE AS data_type \
             FROM information_schema.columns \
             WHERE TABLE_SCHEMA = $1 AND TABLE_NAME = $2 \
             ORDER BY ORDINAL_POSITION"
        }
    }
}

/// Privileges held by the connected account, one `privilege` per row.
pub fn grants_query(dialect: ExternalDialect) -> &'static str {
    match dialect {
        ExternalDialect::Postgres => {
            "SELECT DISTINCT privilege_type::text AS privilege \
             FROM information_schema.table_privileges \
             WHERE grantee IN (SELECT rolname FROM pg_roles WHERE pg_has_role(current_user, oid, 'member')) \
             UNION SELECT 'SUPER' FROM pg_roles WHERE rolname = current_user AND rolsuper \
             UNION SELECT 'CREATE' FROM pg_roles WHERE rolname = current_user AND rolcreatedb \
             UNION SELECT 'GRANT' FROM pg_roles WHERE rolname = current_user AND rolcreaterole"
        }
        ExternalDialect::MySql => {
            "SELECT DISTINCT PRIVILEGE_TYPE AS privilege FROM information_schema.user_privileges \
             WHERE GRANTEE = CONCAT('''', SUBSTRING_INDEX(CURRENT_USER(), '@', 1), '''@''', SUBSTRING_INDEX(CURRENT_USER(), '@', -1), '''') \
             UNION SELECT DISTINCT PRIVILEGE_TYPE FROM information_schema.schema_privileges \
             WHERE GRANTEE = CONCAT('''', SUBSTRING_INDEX(CURRENT_USER(), '@', 1), '''@''', SUBSTRING_INDEX(CURRENT_USER(), '@', -1), '''') \
             AND TABLE_SCHEMA = DATABASE()"
        }
    }
}

/// Fixed non-mapping templates the connection is allowed to run.
pub fn introspection_templates(dialect: ExternalDialect) -> [&'static str; 3] {
    [PING_QUERY, columns_query(dialect), grants_query(dialect)]
}

/// Schema name passed to `columns_query`.
pub fn introspection_schema(cfg: &ExternalDbConfig) -> String {
    match cfg.dialect {
        ExternalDialect::Postgres => cfg.schema.clone(),
        ExternalDialect::MySql => cfg.database.clone(),
    }
}

const DANGEROUS_PREFIXES: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "TRUNCATE", "CREATE", "DROP", "ALTER", "INDEX", "GRANT",
    "REVOKE", "ALL", "SUPER", "TRIGGER", "REFERENCES", "FILE", "EVENT",
];

/// Privilege names that let the account change data, schema or access.
pub fn is_dangerous_grant(privilege: &str) -> bool {
    let p = privilege.trim().to_ascii_uppercase();
    DANGEROUS_PREFIXES.iter().any(|d| {
        p == *d || p.starts_with(&format!("{d} ")) || p.starts_with(&format!("{d}_"))
    })
}

const PG_AUTH_CODES: &[&str] = &["28P01", "28000"];
const MYSQL_AUTH_NUMBERS: &[u16] = &[1044, 1045, 1698];
const AUTH_MESSAGES: &[&str] = &["password authentication failed", "access denied"];

/// Whether a driver error means the credential itself was refused.
pub fn is_auth_failure(
    dialect: ExternalDialect,
    sqlstate: Option<&str>,
    mysql_number: Option<u16>,
    message: &str,
) -> bool {
    let by_code = match dialect {
        ExternalDialect::Postgres => sqlstate.is_some_and(|c| PG_AUTH_CODES.contains(&c)),
        ExternalDialect::MySql => mysql_number.is_some_and(|n| MYSQL_AUTH_NUMBERS.contains(&n)),
    };
    let lowered = message.to_ascii_lowercase();
    by_code || AUTH_MESSAGES.iter().any(|m| lowered.contains(m))
}

/// Map a sqlx error from the external source into the crate error, singling
/// out refused credentials and pool timeouts.
pub fn classify_sqlx_error(dialect: ExternalDialect, context: &str, e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(db) => {
            let sqlstate = db.code().map(|c| c.to_string());
            let mysql_number = db
                .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                .map(|m| m.number());
            if is_auth_failure(dialect, sqlstate.as_deref(), mysql_number, db.message()) {
                return Error::AuthFailure(db.message().to_string());
            }
        }
        sqlx::Error::PoolTimedOut => {
            return Error::BackendMessage(format!("{context}: timed out acquiring connection"));
        }
        _ => {}
    }
    if is_auth_failure(dialect, None, None, &e.to_string()) {
        return Error::AuthFailure(e.to_string());
    }
    Error::backend(context.to_string(), e)
}
