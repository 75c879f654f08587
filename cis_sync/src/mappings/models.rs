use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::events::EventType;
use crate::{Error, Result};

/// One row read from the external source, keyed by projected column name.
pub type Row = Map<String, Value>;

/// Which local entities a row references and must exist before its event is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionKind {
    /// No local entity referenced.
    None,
    /// Primary and optional counterparty user ids.
    Users,
    /// The row itself is a category, upserted locally.
    Category,
}

/// A contact column compared against the last stored value on identity-bearing tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchedField {
    /// Name used in emitted change events ("email", "phone").
    pub field: &'static str,
    /// Source column carrying the value.
    pub column: &'static str,
}

/// Immutable per-table sync configuration.
#[derive(Debug, Clone)]
pub struct TableMapping {
    pub source_table: &'static str,
    /// Indexed, monotonically increasing column used to paginate.
    pub cursor_column: &'static str,
    pub primary_key_column: &'static str,
    /// Columns to SELECT. Must include the cursor and primary key columns.
    pub select_projection: &'static str,
    pub event_type_of: fn(&Row) -> EventType,
    pub to_payload: fn(&Row) -> Map<String, Value>,
    pub extract_primary_entity_id: fn(&Row) -> Option<String>,
    pub extract_counterparty_id: Option<fn(&Row) -> Option<String>>,
    /// Appended to the poll query's WHERE clause.
    pub extra_filter: Option<&'static str>,
    pub provision: ProvisionKind,
    /// Non-empty only for identity-bearing tables.
    pub watched_fields: &'static [WatchedField],
}

impl TableMapping {
    pub fn is_identity_bearing(&self) -> bool {
        !self.watched_fields.is_empty()
    }

    /// Bare column names referenced by the projection (aliases and expressions stripped).
    pub fn projection_columns(&self) -> Vec<String> {
        parse_projection_columns(self.select_projection)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_table.trim().is_empty() {
            return Err(Error::InvalidInput("mapping source_table is empty".to_string()));
        }
        let cols = self.projection_columns();
        for required in [self.cursor_column, self.primary_key_column] {
            if !cols.iter().any(|c| c.eq_ignore_ascii_case(required)) {
                return Err(Error::InvalidInput(format!(
                    "mapping '{}' projection is missing required column '{}'",
                    self.source_table, required
                )));
            }
        }
        Ok(())
    }

    /// The single SELECT template this table is polled with.
    ///
    /// `$1` is the watermark, `$2` the batch size and `$3` the primary key of
    /// the last row synced at the watermark, so rows sharing the watermark's
    /// cursor value resume after it instead of being skipped.
    pub fn poll_query(&self) -> String {
        let projection = self
            .select_projection
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let filter = self
            .extra_filter
            .map(|f| format!(" AND ({f})"))
            .unwrap_or_default();
        format!(
            "SELECT {projection} FROM {table} \
             WHERE ({cursor} > $1 OR ({cursor} = $1 AND {pk} > $3)){filter} \
             ORDER BY {cursor} ASC, {pk} ASC LIMIT $2",
            table = self.source_table,
            cursor = self.cursor_column,
            pk = self.primary_key_column,
        )
    }

    pub fn cursor_value(&self, row: &Row) -> Option<DateTime<Utc>> {
        row_timestamp(row, self.cursor_column)
    }

    pub fn source_id(&self, row: &Row) -> Option<String> {
        row_str(row, self.primary_key_column)
    }
}

const NON_COLUMN_WORDS: &[&str] = &[
    "null", "true", "false", "as", "case", "when", "then", "else", "end", "and", "or", "not",
    "distinct", "is", "in", "interval",
];

fn bare_identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z_][A-Za-z0-9_]*\.)?([A-Za-z_][A-Za-z0-9_]*)$").expect("static regex")
    })
}

fn alias_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s+as\s+[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:[A-Za-z_][A-Za-z0-9_]*\.)?([A-Za-z_][A-Za-z0-9_]*)\s*(\()?")
            .expect("static regex")
    })
}

/// Split a SELECT projection into the bare source columns it reads.
///
/// `a, b AS c, t.d, COALESCE(e, 'x') AS f` yields `[a, b, d, e]`.
pub fn parse_projection_columns(projection: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in split_top_level(projection) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let expr = alias_re().replace(item, "");
        let expr = expr.trim();
        let cols: Vec<String> = match bare_identifier_re().captures(expr) {
            Some(c) => vec![c[1].to_ascii_lowercase()],
            None => expression_columns(expr),
        };
        for c in cols {
            if !out.contains(&c) {
                out.push(c);
            }
        }
    }
    out
}

fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut cur = String::new();
    for ch in s.chars() {
        match ch {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth -= 1,
            ',' if !in_quote && depth == 0 => {
                parts.push(std::mem::take(&mut cur));
                continue;
            }
            _ => {}
        }
        cur.push(ch);
    }
    parts.push(cur);
    parts
}

fn expression_columns(expr: &str) -> Vec<String> {
    // Drop string literals before scanning for identifiers.
    let mut unquoted = String::with_capacity(expr.len());
    let mut in_quote = false;
    for ch in expr.chars() {
        if ch == '\'' {
            in_quote = !in_quote;
            unquoted.push(' ');
        } else if !in_quote {
            unquoted.push(ch);
        }
    }
    identifier_re()
        .captures_iter(&unquoted)
        .filter(|c| c.get(2).is_none())
        .map(|c| c[1].to_ascii_lowercase())
        .filter(|w| !NON_COLUMN_WORDS.contains(&w.as_str()))
        .filter(|w| !w.chars().all(|ch| ch.is_ascii_digit()))
        .collect()
}

// ─── Row access ─────────────────────────────────────────────

/// String view of a column; numbers and booleans are stringified, null is `None`.
pub fn row_str(row: &Row, col: &str) -> Option<String> {
    match row.get(col)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Non-empty string view of a column.
pub fn row_nonempty(row: &Row, col: &str) -> Option<String> {
    row_str(row, col).filter(|s| !s.is_empty())
}

pub fn row_f64(row: &Row, col: &str) -> f64 {
    match row.get(col) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(Value::Bool(true)) => 1.0,
        _ => 0.0,
    }
}

/// Truthiness of tinyint/boolean flag columns (`1`, `true`, `"1"`).
pub fn row_flag(row: &Row, col: &str) -> bool {
    match row.get(col) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true"),
        _ => false,
    }
}

/// Parse a timestamp column. Accepts RFC 3339, naive `YYYY-MM-DD HH:MM:SS[.f]`
/// (interpreted as UTC), and integer epoch seconds.
pub fn row_timestamp(row: &Row, col: &str) -> Option<DateTime<Utc>> {
    match row.get(col)? {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// RFC 3339 rendering of a timestamp column, for payload fields.
pub fn row_iso(row: &Row, col: &str) -> Option<String> {
    row_timestamp(row, col).map(|t| t.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn projection_parsing_strips_aliases_and_expressions() {
        let cols = parse_projection_columns(
            "id, name AS display_name,\n  t.status, COALESCE(phone_number, 'n/a') AS phone, updated_at",
        );
        assert_eq!(cols, vec!["id", "name", "status", "phone_number", "updated_at"]);
    }

    #[test]
    fn projection_parsing_ignores_blank_items() {
        assert_eq!(parse_projection_columns(" id , , created_at "), vec!["id", "created_at"]);
    }

    #[test]
    fn row_helpers() {
        let row: Row = json!({
            "id": 12,
            "flag": 1,
            "amount": "12.50",
            "ts": "2026-02-16 10:00:00",
            "empty": "",
        })
        .as_object()
        .cloned()
        .unwrap();
        assert_eq!(row_str(&row, "id").as_deref(), Some("12"));
        assert!(row_flag(&row, "flag"));
        assert_eq!(row_f64(&row, "amount"), 12.5);
        assert_eq!(row_nonempty(&row, "empty"), None);
        assert_eq!(
            row_timestamp(&row, "ts").map(|t| t.to_rfc3339()),
            Some("2026-02-16T10:00:00+00:00".to_string())
        );
        assert_eq!(row_timestamp(&row, "missing"), None);
    }
}
